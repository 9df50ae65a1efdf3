//! Bundle reassembly: correlates the files of one multi-file transfer by the
//! GUID stamped on every `File` frame and fires one aggregate callback when
//! every file has either arrived or failed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use framelink_pool::{Job, JobPriority, Pool};
use parking_lot::Mutex;

use crate::error::NetError;

/// Aggregate callback: `(failures, successes)` where each success pairs the
/// sender's message with the temp path the file was persisted to.
pub(crate) type BundleCallback = Arc<dyn Fn(Vec<String>, Vec<(String, PathBuf)>) + Send + Sync>;

struct BundleEntry {
    count: u64,
    failures: Vec<String>,
    successes: Vec<(String, PathBuf)>,
}

impl BundleEntry {
    fn is_complete(&self) -> bool {
        (self.failures.len() + self.successes.len()) as u64 == self.count
    }
}

/// Thread-safe map of in-flight bundles. Entries have no deadline; a bundle
/// that never completes lives until its pipeline dies.
pub(crate) struct BundleManager {
    entries: Mutex<HashMap<String, BundleEntry>>,
    pool: Mutex<Option<Arc<Pool>>>,
    callback: Mutex<Option<BundleCallback>>,
}

impl BundleManager {
    pub(crate) fn new() -> Self {
        BundleManager {
            entries: Mutex::new(HashMap::new()),
            pool: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    pub(crate) fn set_pool(&self, pool: Option<Arc<Pool>>) {
        *self.pool.lock() = pool;
    }

    pub(crate) fn set_callback(&self, callback: BundleCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Register a bundle of `count` files. Fails if the guid is already live.
    pub(crate) fn start(&self, guid: &str, count: u64) -> Result<(), NetError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(guid) {
            return Err(NetError::DuplicateBundle(guid.to_string()));
        }
        entries.insert(
            guid.to_string(),
            BundleEntry {
                count,
                failures: Vec::new(),
                successes: Vec::new(),
            },
        );
        Ok(())
    }

    pub(crate) fn failure(&self, guid: &str, message: &str) -> Result<(), NetError> {
        self.append(guid, |entry| entry.failures.push(message.to_string()))
    }

    pub(crate) fn success(&self, guid: &str, message: &str, path: PathBuf) -> Result<(), NetError> {
        self.append(guid, |entry| entry.successes.push((message.to_string(), path)))
    }

    fn append(&self, guid: &str, record: impl FnOnce(&mut BundleEntry)) -> Result<(), NetError> {
        let completed = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(guid)
                .ok_or_else(|| NetError::UnknownBundle(guid.to_string()))?;
            record(entry);
            if entry.is_complete() {
                entries.remove(guid)
            } else {
                None
            }
        };

        if let Some(entry) = completed {
            self.finish(guid, entry)?;
        }
        Ok(())
    }

    /// Hand the completed bundle to the aggregate callback on a `Low` job, or
    /// inline when no pool is attached.
    fn finish(&self, guid: &str, entry: BundleEntry) -> Result<(), NetError> {
        let Some(callback) = self.callback.lock().clone() else {
            tracing::debug!("completed bundle [{guid}] had no callback attached");
            return Ok(());
        };

        let BundleEntry {
            failures, successes, ..
        } = entry;

        let pool = self.pool.lock().clone();
        if let Some(pool) = pool {
            let label = format!("bundle_complete:{guid}");
            pool.push(Job::new(JobPriority::Low, label, move || {
                callback(failures, successes);
                Ok(())
            }))?;
        } else {
            callback(failures, successes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn duplicate_guid_is_rejected() {
        let manager = BundleManager::new();
        manager.start("g1", 2).unwrap();
        assert!(matches!(
            manager.start("g1", 2),
            Err(NetError::DuplicateBundle(_))
        ));
    }

    #[test]
    fn unknown_guid_is_rejected() {
        let manager = BundleManager::new();
        assert!(matches!(
            manager.failure("ghost", "oops"),
            Err(NetError::UnknownBundle(_))
        ));
        assert!(matches!(
            manager.success("ghost", "ok", PathBuf::from("/tmp/x")),
            Err(NetError::UnknownBundle(_))
        ));
    }

    #[test]
    fn aggregate_fires_exactly_once_when_counts_match() {
        let manager = BundleManager::new();
        let (tx, rx) = mpsc::channel();
        manager.set_callback(Arc::new(move |failures, successes| {
            tx.send((failures, successes)).ok();
        }));

        manager.start("g2", 3).unwrap();
        manager.failure("g2", "broken").unwrap();
        manager
            .success("g2", "first", PathBuf::from("/tmp/a"))
            .unwrap();
        assert!(rx.try_recv().is_err());

        manager
            .success("g2", "second", PathBuf::from("/tmp/b"))
            .unwrap();
        let (failures, successes) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(failures, vec!["broken".to_string()]);
        assert_eq!(successes.len(), 2);

        // Entry is gone; further appends fail.
        assert!(manager.failure("g2", "late").is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn completion_routes_through_the_pool_when_attached() {
        let pool = Arc::new(Pool::new("bundle-test"));
        pool.add_worker(&[JobPriority::Low]);
        pool.start().unwrap();

        let manager = BundleManager::new();
        manager.set_pool(Some(pool.clone()));
        let (tx, rx) = mpsc::channel();
        manager.set_callback(Arc::new(move |failures, successes| {
            tx.send((failures.len(), successes.len())).ok();
        }));

        manager.start("g3", 1).unwrap();
        manager
            .success("g3", "only", PathBuf::from("/tmp/only"))
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (0, 1));
        pool.stop(true);
    }
}
