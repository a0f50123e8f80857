//! Remote video detection.
//!
//! Whether the peer's camera is on is inferred from two independent
//! sources: received-frame counters in the periodic stats, and explicit
//! capture-state messages from the peer. [`RemoteVideoStateDetector`]
//! combines both so that the visible state only flips when neither source
//! still claims the opposite.

use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// Statistics of one media track, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackStats {
    pub kind: String,
    pub remote_source: bool,
    pub ended: bool,
    pub frames_received: u64,
}

impl TrackStats {
    pub fn remote_video(frames_received: u64) -> Self {
        Self {
            kind: "video".to_string(),
            remote_source: true,
            ended: false,
            frames_received,
        }
    }
}

/// One periodic stats delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub tracks: Vec<TrackStats>,
    /// The selected candidate pair goes through a TURN relay.
    pub uses_relay: bool,
    /// Short human-readable rendering for the debug overlay.
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameActivity {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    Stopped,
    Started,
}

/// Tracks incoming frame counters and reports when the peer starts or
/// stops sending video.
#[derive(Debug)]
pub struct FrameDetector {
    state: FlowState,
    last_frame_count: u64,
    last_detection: Option<Instant>,
    stop_threshold: Duration,
}

impl FrameDetector {
    pub fn new(stop_threshold: Duration) -> Self {
        Self {
            state: FlowState::Stopped,
            last_frame_count: 0,
            last_detection: None,
            stop_threshold,
        }
    }

    pub fn on_stats(&mut self, tracks: &[TrackStats], now: Instant) -> Option<FrameActivity> {
        let total = total_frames_received(tracks);

        if total > self.last_frame_count {
            self.last_frame_count = total;
            self.last_detection = Some(now);
            if self.state == FlowState::Stopped {
                self.state = FlowState::Started;
                debug!(target: "Call/Video", "Frame detector: started");
                return Some(FrameActivity::Started);
            }
        } else if total == self.last_frame_count {
            if let (FlowState::Started, Some(last)) = (self.state, self.last_detection) {
                if now.duration_since(last) > self.stop_threshold {
                    self.state = FlowState::Stopped;
                    debug!(target: "Call/Video", "Frame detector: stopped");
                    return Some(FrameActivity::Stopped);
                }
            }
        } else {
            warn!(
                target: "Call/Video",
                "Frame count decreased from {} to {}",
                self.last_frame_count,
                total
            );
            self.last_frame_count = total;
        }
        None
    }

    pub fn reset(&mut self) {
        self.state = FlowState::Stopped;
        self.last_frame_count = 0;
        self.last_detection = None;
    }
}

fn total_frames_received(tracks: &[TrackStats]) -> u64 {
    tracks
        .iter()
        .filter(|t| t.remote_source && !t.ended && t.kind == "video")
        .map(|t| t.frames_received)
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteVideoChange {
    Started,
    Stopped,
}

#[derive(Debug, Default)]
pub struct RemoteVideoStateDetector {
    frames: bool,
    signaled: bool,
    incoming: bool,
}

impl RemoteVideoStateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn on_frames_started(&mut self) -> Option<RemoteVideoChange> {
        self.frames = true;
        self.start("frames")
    }

    pub fn on_frames_stopped(&mut self) -> Option<RemoteVideoChange> {
        self.frames = false;
        // the peer still signals an enabled camera
        if self.signaled {
            return None;
        }
        self.stop("frames")
    }

    pub fn on_capturing_enabled(&mut self) -> Option<RemoteVideoChange> {
        self.signaled = true;
        self.start("signaling")
    }

    pub fn on_capturing_disabled(&mut self) -> Option<RemoteVideoChange> {
        self.signaled = false;
        if self.frames {
            return None;
        }
        self.stop("signaling")
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn start(&mut self, reason: &str) -> Option<RemoteVideoChange> {
        if self.incoming {
            return None;
        }
        self.incoming = true;
        info!(target: "Call/Video", "Incoming video started (reason: {reason})");
        Some(RemoteVideoChange::Started)
    }

    fn stop(&mut self, reason: &str) -> Option<RemoteVideoChange> {
        if !self.incoming {
            return None;
        }
        self.incoming = false;
        info!(target: "Call/Video", "Incoming video stopped (reason: {reason})");
        Some(RemoteVideoChange::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(1);

    #[test]
    fn test_frame_detector_start_and_stop() {
        let mut detector = FrameDetector::new(THRESHOLD);
        let t0 = Instant::now();

        assert_eq!(detector.on_stats(&[TrackStats::remote_video(0)], t0), None);
        assert_eq!(
            detector.on_stats(&[TrackStats::remote_video(30)], t0 + Duration::from_millis(500)),
            Some(FrameActivity::Started)
        );
        assert_eq!(
            detector.on_stats(&[TrackStats::remote_video(60)], t0 + Duration::from_millis(1000)),
            None
        );
        // stalled, but not long enough
        assert_eq!(
            detector.on_stats(&[TrackStats::remote_video(60)], t0 + Duration::from_millis(1900)),
            None
        );
        assert_eq!(
            detector.on_stats(&[TrackStats::remote_video(60)], t0 + Duration::from_millis(2100)),
            Some(FrameActivity::Stopped)
        );
    }

    #[test]
    fn test_frame_detector_ignores_local_and_ended_tracks() {
        let mut detector = FrameDetector::new(THRESHOLD);
        let local = TrackStats {
            remote_source: false,
            ..TrackStats::remote_video(100)
        };
        let ended = TrackStats {
            ended: true,
            ..TrackStats::remote_video(100)
        };
        let audio = TrackStats {
            kind: "audio".to_string(),
            ..TrackStats::remote_video(100)
        };
        assert_eq!(detector.on_stats(&[local, ended, audio], Instant::now()), None);
    }

    #[test]
    fn test_frame_count_decrease_resets_baseline() {
        let mut detector = FrameDetector::new(THRESHOLD);
        let t0 = Instant::now();
        detector.on_stats(&[TrackStats::remote_video(100)], t0);
        assert_eq!(detector.on_stats(&[TrackStats::remote_video(10)], t0), None);
        assert_eq!(detector.last_frame_count, 10);
    }

    #[test]
    fn test_signaled_camera_keeps_video_visible_when_frames_stall() {
        let mut detector = RemoteVideoStateDetector::new();
        assert_eq!(
            detector.on_capturing_enabled(),
            Some(RemoteVideoChange::Started)
        );
        assert_eq!(detector.on_frames_started(), None);
        assert_eq!(detector.on_frames_stopped(), None);
        assert!(detector.is_incoming());
        assert_eq!(
            detector.on_capturing_disabled(),
            Some(RemoteVideoChange::Stopped)
        );
    }

    #[test]
    fn test_frames_keep_video_visible_when_signaling_says_off() {
        let mut detector = RemoteVideoStateDetector::new();
        assert_eq!(detector.on_frames_started(), Some(RemoteVideoChange::Started));
        assert_eq!(detector.on_capturing_enabled(), None);
        assert_eq!(detector.on_capturing_disabled(), None);
        assert!(detector.is_incoming());
        assert_eq!(detector.on_frames_stopped(), Some(RemoteVideoChange::Stopped));
        assert!(!detector.is_incoming());
    }
}
