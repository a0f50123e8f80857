//! Camera capturing state, guarded by its own lock.
//!
//! When both are needed, the quality lock is always taken before this one.

use super::collaborators::PeerConnection;
use super::error::EngineError;
use super::video_quality::VideoProfile;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct CaptureState {
    capturing: bool,
}

#[derive(Debug, Default)]
pub struct Capturer {
    state: Mutex<CaptureState>,
    switch_in_progress: AtomicBool,
}

impl Capturer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_capturing(&self) -> bool {
        self.state.lock().await.capturing
    }

    pub(crate) async fn start(
        &self,
        connection: &dyn PeerConnection,
        profile: VideoProfile,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        connection.start_capturing(profile).await?;
        state.capturing = true;
        info!(target: "Call/Video", "Started capturing with {profile}");
        Ok(())
    }

    pub(crate) async fn stop(&self, connection: &dyn PeerConnection) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        connection.stop_capturing().await?;
        state.capturing = false;
        info!(target: "Call/Video", "Stopped capturing");
        Ok(())
    }

    /// Apply new outgoing parameters. A connection that went away in the
    /// meantime is not an error.
    pub(crate) async fn change_params(
        &self,
        connection: &dyn PeerConnection,
        profile: VideoProfile,
    ) -> Result<(), EngineError> {
        let _state = self.state.lock().await;
        match connection.change_outgoing_video_params(profile).await {
            Err(EngineError::Closed) => {
                debug!(target: "Call/Video", "Peer connection closed while changing video params");
                Ok(())
            }
            other => other,
        }
    }

    /// Toggle between front and rear camera. Returns `None` if a switch is
    /// already running.
    pub(crate) async fn switch_camera(
        &self,
        connection: &dyn PeerConnection,
    ) -> Result<Option<bool>, EngineError> {
        if self.switch_in_progress.swap(true, Ordering::SeqCst) {
            debug!(target: "Call/Video", "Ignoring camera switch request, already in progress");
            return Ok(None);
        }
        let _guard = scopeguard::guard((), |_| {
            self.switch_in_progress.store(false, Ordering::SeqCst);
        });

        let state = self.state.lock().await;
        if !state.capturing {
            debug!(target: "Call/Video", "Ignoring camera switch request, not capturing");
            return Ok(None);
        }
        let front = connection.switch_camera().await?;
        info!(
            target: "Call/Video",
            "Switched camera to {}",
            if front { "front cam" } else { "rear cam" }
        );
        Ok(Some(front))
    }

    /// Returns `true` if the engine produced a frame although we believe
    /// capturing is off.
    pub(crate) async fn resync_on_first_frame(&self) -> bool {
        let state = self.state.lock().await;
        if !state.capturing {
            warn!(
                target: "Call/Video",
                "Received first camera frame even though capturing should be off"
            );
            return true;
        }
        false
    }

    pub(crate) async fn reset(&self) {
        self.state.lock().await.capturing = false;
    }
}
