//! Connection handles shared by the dumper and importers of one task.
//!
//! The [`DataSourceManager`] is owned by the incremental task. Sources and
//! targets borrow handles from it and never close them; the task closes the
//! manager exactly once when it finishes.

use crate::{Error, Result};
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// A connection (or pool, or file) that must be released explicitly.
pub trait DataSource: Send + Sync + 'static {
    /// Releases the underlying resource. Called once, synchronously.
    fn close(&self);
}

struct Handle {
    source: Arc<dyn DataSource>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Opens data sources on demand and closes all of them at once.
pub struct DataSourceManager {
    sources: Mutex<HashMap<String, Handle>>,
    closed: AtomicBool,
}

impl DataSourceManager {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Handle>> {
        self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn downcast<T: DataSource>(key: &str, handle: &Handle) -> Result<Arc<T>> {
        handle.typed.clone().downcast::<T>().map_err(|_| {
            Error::InvalidState(format!("data source '{}' was opened with another type", key))
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "data source manager is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the handle registered under `key`, opening it with `open` if
    /// there is none yet.
    ///
    /// When two callers race to open the same key, the loser's handle is
    /// closed and both get the winner's.
    pub async fn get_or_open<T, F, Fut>(&self, key: &str, open: F) -> Result<Arc<T>>
    where
        T: DataSource,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        if let Some(handle) = self.lock().get(key) {
            return Self::downcast(key, handle);
        }

        let opened = Arc::new(open().await?);

        let mut sources = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            opened.close();
            return Err(Error::InvalidState(
                "data source manager is closed".to_string(),
            ));
        }

        match sources.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                opened.close();
                Self::downcast(key, entry.get())
            }
            Entry::Vacant(entry) => {
                debug!("Opened data source '{}'", key);
                entry.insert(Handle {
                    source: opened.clone(),
                    typed: opened.clone(),
                });
                Ok(opened)
            }
        }
    }

    /// Number of handles currently open.
    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes every handle. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let handles: Vec<_> = self.lock().drain().collect();
        for (key, handle) in &handles {
            debug!("Closing data source '{}'", key);
            handle.source.close();
        }
        info!("Closed {} data source(s)", handles.len());
    }
}

impl Default for DataSourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DataSourceManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DataSourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceManager")
            .field("open", &self.open_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingSource {
        closes: Arc<AtomicUsize>,
    }

    impl DataSource for CountingSource {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct OtherSource;

    impl DataSource for OtherSource {
        fn close(&self) {}
    }

    #[tokio::test]
    async fn test_opens_once_and_closes_once() {
        let manager = DataSourceManager::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let opens = AtomicUsize::new(0);

        for _ in 0..3 {
            manager
                .get_or_open("target", || async {
                    opens.fetch_add(1, Ordering::SeqCst);
                    Ok(CountingSource {
                        closes: closes.clone(),
                    })
                })
                .await
                .unwrap();
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.open_count(), 1);

        manager.close();
        manager.close();
        drop(manager);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_rejected() {
        let manager = DataSourceManager::new();
        manager
            .get_or_open("ds", || async { Ok(OtherSource) })
            .await
            .unwrap();

        let err = manager
            .get_or_open("ds", || async { Ok(CountingSource::default()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_new_handles() {
        let manager = DataSourceManager::new();
        manager.close();

        let result = manager
            .get_or_open("ds", || async { Ok(OtherSource) })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.open_count(), 0);
    }
}
