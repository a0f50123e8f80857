//! Video quality negotiation.
//!
//! Three profiles are tracked per call: `local` (from user preference and
//! network metering), `remote` (announced by the peer) and `common` (what
//! we actually send). `common` is the field-wise minimum of the other two,
//! capped further while media is relayed, so the result does not depend on
//! whether the local or the remote update came first.

use super::capture::Capturer;
use super::collaborators::{PeerConnection, PeerSignalingMessage};
use super::error::EngineError;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// User setting for outgoing video quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoPreference {
    /// Low on metered networks, high otherwise.
    #[default]
    Auto,
    Low,
    High,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VideoTier {
    Low,
    High,
    Max,
}

impl VideoTier {
    pub fn resolution(&self) -> (u32, u32) {
        match self {
            Self::Low => (640, 360),
            Self::High => (1280, 720),
            Self::Max => (1920, 1080),
        }
    }

    pub fn max_fps(&self) -> u32 {
        match self {
            Self::Low => 20,
            Self::High | Self::Max => 25,
        }
    }

    pub fn max_bitrate_kbps(&self) -> u32 {
        match self {
            Self::Low => 400,
            Self::High => 2000,
            Self::Max => 4000,
        }
    }
}

/// Highest tier allowed while media goes through a relay.
const RELAYED_TIER_CAP: VideoTier = VideoTier::High;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoProfile {
    pub tier: VideoTier,
    pub hardware_accelerated: bool,
}

impl VideoProfile {
    pub fn new(tier: VideoTier, hardware_accelerated: bool) -> Self {
        Self {
            tier,
            hardware_accelerated,
        }
    }

    pub fn from_preference(
        preference: VideoPreference,
        network_metered: bool,
        hardware_accelerated: bool,
    ) -> Self {
        let tier = match preference {
            VideoPreference::Auto if network_metered => VideoTier::Low,
            VideoPreference::Auto => VideoTier::High,
            VideoPreference::Low => VideoTier::Low,
            VideoPreference::High => VideoTier::High,
            VideoPreference::Max => VideoTier::Max,
        };
        Self::new(tier, hardware_accelerated)
    }

    /// Profile both sides can handle.
    pub fn common_with(&self, other: Option<&VideoProfile>, relayed: bool) -> VideoProfile {
        let mut common = match other {
            Some(other) => VideoProfile {
                tier: self.tier.min(other.tier),
                hardware_accelerated: self.hardware_accelerated && other.hardware_accelerated,
            },
            None => *self,
        };
        if relayed {
            common.tier = common.tier.min(RELAYED_TIER_CAP);
        }
        common
    }
}

impl fmt::Display for VideoProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.tier.resolution();
        write!(
            f,
            "{:?}({}x{}@{}fps,{}kbps{})",
            self.tier,
            w,
            h,
            self.tier.max_fps(),
            self.tier.max_bitrate_kbps(),
            if self.hardware_accelerated { ",hw" } else { "" }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoProfiles {
    pub local: Option<VideoProfile>,
    pub remote: Option<VideoProfile>,
    pub common: Option<VideoProfile>,
    pub relayed: bool,
}

impl VideoProfiles {
    fn recompute(&mut self) {
        if let Some(local) = &self.local {
            self.common = Some(local.common_with(self.remote.as_ref(), self.relayed));
        }
    }
}

/// Live peer connection a profile change should be applied to.
pub struct QualityLink<'a> {
    pub connection: Arc<dyn PeerConnection>,
    pub capturer: &'a Capturer,
    /// Quality announcements only go out once the data channel is up.
    pub calling: bool,
}

fn describe(profile: Option<&VideoProfile>) -> String {
    profile.map_or_else(|| "none".to_string(), |p| p.to_string())
}

#[derive(Debug)]
pub struct VideoQualityNegotiator {
    pub(super) profiles: RwLock<VideoProfiles>,
    preference: std::sync::Mutex<VideoPreference>,
    hardware_accelerated: bool,
}

impl VideoQualityNegotiator {
    pub fn new(preference: VideoPreference, hardware_accelerated: bool) -> Self {
        Self {
            profiles: RwLock::new(VideoProfiles::default()),
            preference: std::sync::Mutex::new(preference),
            hardware_accelerated,
        }
    }

    pub fn preference(&self) -> VideoPreference {
        *self
            .preference
            .lock()
            .expect("Mutex should not be poisoned")
    }

    pub fn set_preference(&self, preference: VideoPreference) {
        *self
            .preference
            .lock()
            .expect("Mutex should not be poisoned") = preference;
    }

    pub async fn profiles(&self) -> VideoProfiles {
        self.profiles.read().await.clone()
    }

    pub async fn is_relayed(&self) -> bool {
        self.profiles.read().await.relayed
    }

    /// Recompute our own profile after a change of network metering,
    /// relaying or user preference.
    pub async fn update_own_profile(
        &self,
        network_metered: bool,
        network_relayed: bool,
        link: Option<QualityLink<'_>>,
    ) -> Result<(), EngineError> {
        debug!(
            target: "Call/Quality",
            "update_own_profile: metered={network_metered} relayed={network_relayed}"
        );
        let mut profiles = self.profiles.write().await;
        let local =
            VideoProfile::from_preference(self.preference(), network_metered, self.hardware_accelerated);
        profiles.local = Some(local);
        profiles.relayed = network_relayed;
        profiles.recompute();

        let Some(link) = link else {
            return Ok(());
        };
        if link.calling {
            swallow_closed(
                link.connection
                    .send_signaling_message(PeerSignalingMessage::VideoQualityProfile(local))
                    .await,
            )?;
        }
        self.apply_common(&profiles, &link).await
    }

    /// Store the profile announced by the peer and adapt our outgoing video.
    pub async fn update_peer_profile(
        &self,
        remote: VideoProfile,
        link: Option<QualityLink<'_>>,
    ) -> Result<(), EngineError> {
        info!(target: "Call/Quality", "Peer changed video profile to {remote}");
        let mut profiles = self.profiles.write().await;
        profiles.remote = Some(remote);
        profiles.recompute();

        match link {
            Some(link) => self.apply_common(&profiles, &link).await,
            None => Ok(()),
        }
    }

    /// Returns whether the relay status changed. Only a change triggers a
    /// profile update.
    pub async fn update_relay_state(
        &self,
        network_relayed: bool,
        network_metered: bool,
        link: Option<QualityLink<'_>>,
    ) -> Result<bool, EngineError> {
        if self.profiles.read().await.relayed == network_relayed {
            return Ok(false);
        }
        self.update_own_profile(network_metered, network_relayed, link)
            .await?;
        Ok(true)
    }

    /// Send our current local profile to the peer, if there is one.
    pub async fn announce_local_profile(
        &self,
        connection: &dyn PeerConnection,
    ) -> Result<(), EngineError> {
        let profiles = self.profiles.read().await;
        if let Some(local) = profiles.local {
            swallow_closed(
                connection
                    .send_signaling_message(PeerSignalingMessage::VideoQualityProfile(local))
                    .await,
            )?;
        }
        Ok(())
    }

    /// Start the camera with the common profile. Takes the quality lock,
    /// then the capture lock.
    pub async fn start_capturing(
        &self,
        connection: &dyn PeerConnection,
        capturer: &Capturer,
    ) -> Result<(), EngineError> {
        let profiles = self.profiles.read().await;
        let profile = profiles
            .common
            .or(profiles.local)
            .unwrap_or_else(|| {
                VideoProfile::from_preference(self.preference(), false, self.hardware_accelerated)
            });
        capturer.start(connection, profile).await
    }

    /// Render the L/R/C profile lines for debug output. Gives up and
    /// returns `None` if the lock cannot be read within `wait`.
    pub async fn try_describe(&self, wait: Duration) -> Option<String> {
        let profiles = tokio::time::timeout(wait, self.profiles.read()).await.ok()?;
        Some(format!(
            "\nL={}\nR={}\nC={}",
            describe(profiles.local.as_ref()),
            describe(profiles.remote.as_ref()),
            describe(profiles.common.as_ref())
        ))
    }

    pub async fn reset(&self) {
        *self.profiles.write().await = VideoProfiles::default();
    }

    async fn apply_common(
        &self,
        profiles: &VideoProfiles,
        link: &QualityLink<'_>,
    ) -> Result<(), EngineError> {
        let Some(common) = profiles.common else {
            return Ok(());
        };
        link.capturer
            .change_params(link.connection.as_ref(), common)
            .await
    }
}

fn swallow_closed(result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Err(EngineError::Closed) => {
            debug!(target: "Call/Quality", "Peer connection closed during quality update");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn high() -> VideoProfile {
        VideoProfile::new(VideoTier::High, true)
    }

    fn low_sw() -> VideoProfile {
        VideoProfile::new(VideoTier::Low, false)
    }

    #[test]
    fn test_profile_from_preference() {
        assert_eq!(
            VideoProfile::from_preference(VideoPreference::Auto, true, true).tier,
            VideoTier::Low
        );
        assert_eq!(
            VideoProfile::from_preference(VideoPreference::Auto, false, true).tier,
            VideoTier::High
        );
        assert_eq!(
            VideoProfile::from_preference(VideoPreference::Max, true, true).tier,
            VideoTier::Max
        );
    }

    #[test]
    fn test_common_profile_is_symmetric() {
        let a = VideoProfile::new(VideoTier::Max, true);
        let b = low_sw();
        assert_eq!(a.common_with(Some(&b), false), b.common_with(Some(&a), false));
        assert_eq!(a.common_with(Some(&b), false), low_sw());
    }

    #[test]
    fn test_relay_caps_tier() {
        let max = VideoProfile::new(VideoTier::Max, true);
        assert_eq!(max.common_with(None, true).tier, VideoTier::High);
        assert_eq!(max.common_with(None, false).tier, VideoTier::Max);
    }

    #[tokio::test]
    async fn test_common_defaults_to_local() {
        let negotiator = VideoQualityNegotiator::new(VideoPreference::High, true);
        negotiator.update_own_profile(false, false, None).await.unwrap();

        let profiles = negotiator.profiles().await;
        assert_eq!(profiles.local, Some(high()));
        assert_eq!(profiles.common, Some(high()));
        assert!(profiles.remote.is_none());
    }

    #[tokio::test]
    async fn test_update_order_does_not_matter() {
        let own_first = VideoQualityNegotiator::new(VideoPreference::Max, true);
        own_first.update_own_profile(false, true, None).await.unwrap();
        own_first.update_peer_profile(low_sw(), None).await.unwrap();

        let peer_first = VideoQualityNegotiator::new(VideoPreference::Max, true);
        peer_first.update_peer_profile(low_sw(), None).await.unwrap();
        peer_first.update_own_profile(false, true, None).await.unwrap();

        assert_eq!(
            own_first.profiles().await.common,
            peer_first.profiles().await.common
        );
        assert_eq!(own_first.profiles().await.common, Some(low_sw()));
    }

    #[tokio::test]
    async fn test_relay_change_only_updates_on_change() {
        let negotiator = VideoQualityNegotiator::new(VideoPreference::Max, false);
        negotiator.update_own_profile(false, false, None).await.unwrap();

        assert!(!negotiator.update_relay_state(false, false, None).await.unwrap());
        assert!(negotiator.update_relay_state(true, false, None).await.unwrap());
        assert_eq!(
            negotiator.profiles().await.common.map(|p| p.tier),
            Some(VideoTier::High)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_gives_up_while_writer_holds_lock() {
        let negotiator = Arc::new(VideoQualityNegotiator::new(VideoPreference::Low, false));
        negotiator.update_own_profile(false, false, None).await.unwrap();

        let described = negotiator
            .try_describe(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(described.contains("L=Low"));
        assert!(described.contains("R=none"));

        let guard = negotiator.profiles.write().await;
        assert!(
            negotiator
                .try_describe(Duration::from_millis(50))
                .await
                .is_none()
        );
        drop(guard);
    }
}
