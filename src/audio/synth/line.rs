//! Staging areas between the image preprocessor and the engine producers
//!
//! The preprocessor publishes snapshots asynchronously; each producer caches
//! the current snapshot and refreshes it at block boundaries with a
//! non-blocking read, so a slow or paused preprocessor can never stall audio
//! production. Readers always hold a complete, immutable snapshot.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Single-slot snapshot handoff with a version counter.
///
/// Writers replace the snapshot wholesale; readers refresh their cached
/// `Arc` only when the version moved, and skip the refresh entirely if the
/// writer holds the lock at that instant.
pub struct LineStage<T> {
    latest: RwLock<Arc<T>>,
    version: AtomicU64,
}

impl<T> LineStage<T> {
    pub fn new(initial: T) -> Self {
        Self {
            latest: RwLock::new(Arc::new(initial)),
            version: AtomicU64::new(0),
        }
    }

    /// Publish a new snapshot (preprocessor side)
    pub fn publish(&self, value: T) {
        *self.latest.write() = Arc::new(value);
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Blocking read of the current snapshot (init-time use)
    pub fn snapshot(&self) -> Arc<T> {
        Arc::clone(&self.latest.read())
    }

    /// Refresh a cached snapshot without blocking. Returns true when the
    /// cache was updated to a newer version.
    pub fn refresh(&self, cached: &mut Arc<T>, cached_version: &mut u64) -> bool {
        let current = self.version();
        if current == *cached_version {
            return false;
        }
        if let Some(guard) = self.latest.try_read() {
            *cached = Arc::clone(&guard);
            *cached_version = current;
            true
        } else {
            // Writer active right now; keep the previous snapshot and try
            // again at the next block boundary.
            false
        }
    }
}

/// Per-partial target intensities for the additive engine, 16-bit unsigned
pub enum AdditiveLine {
    Mono(Vec<u16>),
    WarmCold { warm: Vec<u16>, cold: Vec<u16> },
}

impl AdditiveLine {
    /// All-dark line of the given width
    pub fn dark(num_partials: usize) -> Self {
        AdditiveLine::Mono(vec![0; num_partials])
    }

    pub fn len(&self) -> usize {
        match self {
            AdditiveLine::Mono(v) => v.len(),
            AdditiveLine::WarmCold { warm, .. } => warm.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Constant-power per-harmonic gain pairs for the poly engine
pub struct HarmonicProfile {
    /// `(left, right)` with `l^2 + r^2` equal to the squared magnitude
    pub gains: Vec<(f32, f32)>,
}

impl HarmonicProfile {
    pub fn silent(harmonics: usize) -> Self {
        Self {
            gains: vec![(0.0, 0.0); harmonics],
        }
    }

    /// Build a profile from magnitudes and pan positions (0 = hard left,
    /// 1 = hard right), enforcing the constant-power split.
    pub fn from_magnitudes(magnitudes: &[f32], pans: &[f32]) -> Self {
        let gains = magnitudes
            .iter()
            .zip(pans.iter())
            .map(|(&mag, &pan)| {
                let angle = pan.clamp(0.0, 1.0) * std::f32::consts::FRAC_PI_2;
                (mag * angle.cos(), mag * angle.sin())
            })
            .collect();
        Self { gains }
    }
}

/// Image-derived waveform scanned by the photowave engine
pub struct ScanTable {
    pub samples: Vec<f32>,
}

impl ScanTable {
    pub fn flat(len: usize) -> Self {
        Self {
            samples: vec![0.0; len.max(1)],
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_refresh_only_on_new_version() {
        let stage = LineStage::new(AdditiveLine::dark(16));
        let mut cached = stage.snapshot();
        let mut version = stage.version();

        assert!(!stage.refresh(&mut cached, &mut version));

        stage.publish(AdditiveLine::Mono(vec![0xFFFF; 16]));
        assert!(stage.refresh(&mut cached, &mut version));
        match &*cached {
            AdditiveLine::Mono(v) => assert_eq!(v[0], 0xFFFF),
            _ => panic!("expected mono line"),
        }
        // No further publishes: refresh reports no change
        assert!(!stage.refresh(&mut cached, &mut version));
    }

    #[test]
    fn test_old_snapshot_survives_publish() {
        let stage = LineStage::new(ScanTable::flat(8));
        let cached = stage.snapshot();
        stage.publish(ScanTable::flat(64));
        // The reader's snapshot is unaffected until it refreshes
        assert_eq!(cached.len(), 8);
        assert_eq!(stage.snapshot().len(), 64);
    }

    #[test]
    fn test_constant_power_profile() {
        let mags = [1.0f32, 0.5, 0.25];
        let pans = [0.0f32, 0.5, 1.0];
        let profile = HarmonicProfile::from_magnitudes(&mags, &pans);
        for (h, &(l, r)) in profile.gains.iter().enumerate() {
            assert_relative_eq!(l * l + r * r, mags[h] * mags[h], epsilon = 1e-6);
        }
        // Hard left and hard right land on one channel only
        assert_relative_eq!(profile.gains[0].1, 0.0, epsilon = 1e-6);
        assert_relative_eq!(profile.gains[2].0, 0.0, epsilon = 1e-6);
        // Center split is equal power
        assert_relative_eq!(profile.gains[1].0, profile.gains[1].1, epsilon = 1e-6);
    }

    #[test]
    fn test_line_lengths() {
        assert_eq!(AdditiveLine::dark(1024).len(), 1024);
        let wc = AdditiveLine::WarmCold {
            warm: vec![0; 512],
            cold: vec![0; 512],
        };
        assert_eq!(wc.len(), 512);
    }
}
