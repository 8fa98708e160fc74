use std::time::Duration;

use serde::{Deserialize, Serialize};

use thea_remote_protocol::FrameFormat;

const MIN_BITRATE: u32 = 500_000;
const BANDWIDTH_HEADROOM: f64 = 0.8;
const RECONFIGURE_THRESHOLD: f64 = 0.10;

/// Named bundle of encoder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QualityProfile {
    BestPerformance,
    Balanced,
    BestQuality,
}

impl QualityProfile {
    pub fn max_bitrate(&self) -> u32 {
        match self {
            QualityProfile::BestPerformance => 3_000_000,
            QualityProfile::Balanced => 8_000_000,
            QualityProfile::BestQuality => 20_000_000,
        }
    }

    pub fn keyframe_interval(&self) -> Duration {
        match self {
            QualityProfile::BestPerformance => Duration::from_secs(5),
            QualityProfile::Balanced => Duration::from_secs(3),
            QualityProfile::BestQuality => Duration::from_secs(2),
        }
    }

    pub fn max_fps(&self) -> u32 {
        match self {
            QualityProfile::BestPerformance => 15,
            QualityProfile::Balanced => 30,
            QualityProfile::BestQuality => 60,
        }
    }

    /// Maps the wire quality knob in [0, 1] onto a profile.
    pub fn from_quality(quality: f32) -> Self {
        if quality < 0.34 {
            QualityProfile::BestPerformance
        } else if quality < 0.75 {
            QualityProfile::Balanced
        } else {
            QualityProfile::BestQuality
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub codec: FrameFormat,
    pub profile: QualityProfile,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub average_bitrate: u32,
}

impl EncoderSettings {
    pub fn new(codec: FrameFormat, profile: QualityProfile, width: u32, height: u32, fps: u32) -> Self {
        Self {
            codec,
            profile,
            width,
            height,
            fps: fps.min(profile.max_fps()),
            average_bitrate: profile.max_bitrate(),
        }
    }
}

/// Adaptive-bitrate decision logic. Pure arithmetic; the stream task owns
/// the encoder and applies whatever this returns.
#[derive(Debug)]
pub struct BitrateController {
    profile: QualityProfile,
    current: u32,
}

impl BitrateController {
    pub fn new(profile: QualityProfile) -> Self {
        Self {
            profile,
            current: profile.max_bitrate(),
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Targets 80 % of the estimated bandwidth, clamped between the floor
    /// and the profile cap. Returns the new bitrate only when the change
    /// exceeds 10 % of the current value; small oscillations never force
    /// an encoder rebuild.
    pub fn adjust(&mut self, bandwidth_bps: u64) -> Option<u32> {
        let target = ((bandwidth_bps as f64) * BANDWIDTH_HEADROOM) as u32;
        let target = target.clamp(MIN_BITRATE, self.profile.max_bitrate());
        let delta = target.abs_diff(self.current) as f64;
        if delta <= self.current as f64 * RECONFIGURE_THRESHOLD {
            return None;
        }
        self.current = target;
        Some(target)
    }
}

/// Keyframe scheduling: one at stream start, one per profile interval,
/// plus any explicitly requested refreshes.
#[derive(Debug)]
pub struct KeyframePolicy {
    interval: Duration,
    last_key_frame: Option<std::time::Instant>,
    refresh_requested: bool,
}

impl KeyframePolicy {
    pub fn new(profile: QualityProfile) -> Self {
        Self {
            interval: profile.keyframe_interval(),
            last_key_frame: None,
            refresh_requested: false,
        }
    }

    pub fn request_refresh(&mut self) {
        self.refresh_requested = true;
    }

    /// Whether the next frame must be a keyframe. Call [Self::produced]
    /// once the encoder actually emitted one.
    pub fn wants_key_frame(&self) -> bool {
        self.refresh_requested
            || match self.last_key_frame {
                None => true,
                Some(at) => at.elapsed() >= self.interval,
            }
    }

    pub fn produced(&mut self, is_key_frame: bool) {
        if is_key_frame {
            self.last_key_frame = Some(std::time::Instant::now());
            self.refresh_requested = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parameters() {
        assert_eq!(QualityProfile::BestPerformance.max_bitrate(), 3_000_000);
        assert_eq!(QualityProfile::Balanced.max_bitrate(), 8_000_000);
        assert_eq!(QualityProfile::BestQuality.max_bitrate(), 20_000_000);
        assert_eq!(QualityProfile::Balanced.max_fps(), 30);
        assert_eq!(
            QualityProfile::BestQuality.keyframe_interval(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_bitrate_steps_down_with_bandwidth() {
        let mut controller = BitrateController::new(QualityProfile::Balanced);
        assert_eq!(controller.current(), 8_000_000);

        // 2 Mbps estimate: 80 % headroom, large change, applied
        assert_eq!(controller.adjust(2_000_000), Some(1_600_000));

        // 1.9 Mbps estimate: target 1.52 Mbps, 5 % off current, ignored
        assert_eq!(controller.adjust(1_900_000), None);
        assert_eq!(controller.current(), 1_600_000);

        // Plenty of bandwidth: capped at the profile maximum
        assert_eq!(controller.adjust(100_000_000), Some(8_000_000));
    }

    #[test]
    fn test_bitrate_never_drops_below_floor() {
        let mut controller = BitrateController::new(QualityProfile::BestPerformance);
        assert_eq!(controller.adjust(100_000), Some(500_000));
        assert_eq!(controller.adjust(10_000), None);
    }

    #[test]
    fn test_keyframe_policy() {
        let mut policy = KeyframePolicy::new(QualityProfile::BestQuality);
        assert!(policy.wants_key_frame(), "first frame is a keyframe");
        policy.produced(true);
        assert!(!policy.wants_key_frame());
        policy.request_refresh();
        assert!(policy.wants_key_frame());
        policy.produced(false);
        assert!(policy.wants_key_frame(), "refresh stays pending");
        policy.produced(true);
        assert!(!policy.wants_key_frame());
    }

    #[test]
    fn test_fps_is_clamped_to_profile() {
        let settings = EncoderSettings::new(
            FrameFormat::H264,
            QualityProfile::BestPerformance,
            1920,
            1080,
            60,
        );
        assert_eq!(settings.fps, 15);
    }
}
