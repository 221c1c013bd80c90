//! Live Sample Cache

use crate::sample::TelemetrySample;
use std::sync::{Arc, RwLock};

/// Holds the most recent sample emitted by the acquisition worker.
///
/// Writers swap in a whole `Arc<TelemetrySample>`; readers clone the `Arc`,
/// so a reader never observes a partially written sample.
#[derive(Debug, Clone, Default)]
pub struct LiveCache {
    latest: Arc<RwLock<Option<Arc<TelemetrySample>>>>,
}

impl LiveCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached sample
    pub fn replace(&self, sample: TelemetrySample) {
        let sample = Arc::new(sample);
        // A poisoned lock still holds a whole sample; recover and overwrite it.
        let mut slot = self.latest.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(sample);
    }

    /// Most recent sample, if any
    pub fn latest(&self) -> Option<Arc<TelemetrySample>> {
        self.latest.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drop the cached sample
    pub fn clear(&self) {
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Channel;
    use chrono::Utc;
    use std::thread;

    #[test]
    fn test_replace_and_read() {
        let cache = LiveCache::new();
        assert!(cache.latest().is_none());

        cache.replace(TelemetrySample::new("4", Utc::now()).with_reading(Channel::Rpm, 800.0));
        let latest = cache.latest().unwrap();
        assert_eq!(latest.get(Channel::Rpm), Some(800.0));

        cache.clear();
        assert!(cache.latest().is_none());
    }

    #[test]
    fn test_readers_never_see_mixed_samples() {
        let cache = LiveCache::new();
        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..2000 {
                    let v = i as f64;
                    let mut sample = TelemetrySample::new("4", Utc::now());
                    for channel in Channel::ALL {
                        sample.set(channel, Some(v));
                    }
                    cache.replace(sample);
                }
            })
        };

        for _ in 0..2000 {
            if let Some(sample) = cache.latest() {
                let first = sample.get(Channel::Rpm);
                assert!(Channel::ALL.iter().all(|c| sample.get(*c) == first));
            }
        }
        writer.join().unwrap();
    }
}
