/// Produces a playable duration for an object from what the listing knows.
pub trait DurationEstimator: Send + Sync {
    fn estimate_seconds(&self, size_bytes: u64) -> u32;
}

/// Assumes a constant bitrate and clamps the result.
///
/// The default is 128 kbps clamped to [30, 600] seconds. This is a
/// placeholder until real duration probing exists.
#[derive(Debug, Clone, Copy)]
pub struct BitrateEstimator {
    pub bits_per_second: u64,
    pub min_seconds: u32,
    pub max_seconds: u32,
}

impl Default for BitrateEstimator {
    fn default() -> Self {
        Self {
            bits_per_second: 128_000,
            min_seconds: 30,
            max_seconds: 600,
        }
    }
}

impl DurationEstimator for BitrateEstimator {
    fn estimate_seconds(&self, size_bytes: u64) -> u32 {
        let seconds = (size_bytes as u128 * 8) / self.bits_per_second.max(1) as u128;
        let clamped = seconds.clamp(self.min_seconds as u128, self.max_seconds as u128);
        clamped as u32
    }
}
