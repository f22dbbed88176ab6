//! Asset tracking collaborator interface.
//!
//! The platform keeps a registry of which service touched which asset and
//! how; the registry itself lives outside this crate. The ingest path calls
//! [`AssetTracker::track`] the first time it sees an asset.

use parking_lot::Mutex;
use std::collections::HashSet;

pub trait AssetTracker: Send + Sync {
    fn track(&self, service: &str, asset: &str, event: &str);
}

/// In-memory deduplicating tracker for hosts without a registry and for
/// tests.
#[derive(Default)]
pub struct MemoryTracker {
    seen: Mutex<HashSet<(String, String, String)>>,
}

impl MemoryTracker {
    pub fn contains(&self, service: &str, asset: &str, event: &str) -> bool {
        self.seen.lock().contains(&(
            service.to_string(),
            asset.to_string(),
            event.to_string(),
        ))
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

impl AssetTracker for MemoryTracker {
    fn track(&self, service: &str, asset: &str, event: &str) {
        let inserted = self.seen.lock().insert((
            service.to_string(),
            asset.to_string(),
            event.to_string(),
        ));
        if inserted {
            tracing::debug!(service, asset, event, "asset tracked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_deduplicates() {
        let tracker = MemoryTracker::default();
        tracker.track("svc", "pump1", "Ingest");
        tracker.track("svc", "pump1", "Ingest");
        tracker.track("svc", "pump2", "Ingest");
        assert_eq!(tracker.len(), 2);
        assert!(tracker.contains("svc", "pump1", "Ingest"));
        assert!(!tracker.contains("svc", "pump1", "Egress"));
    }
}
