//! Configuration-file writeback. Whenever the
//! Router's dirty flag is set — a port-discovery whitelist change, a seed
//! rotation, an assignment change — this collaborator serializes the
//! in-memory configuration back to disk on a debounced background task,
//! using the same `RouterConfig::save` the loader's `load` is symmetric
//! with.

use crate::config::RouterConfig;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Debounced writer: polls the dirty flag on an interval rather than saving
/// synchronously on every mutation, so a burst of rotations or whitelist
/// grants collapses into a single write.
pub struct ConfigPersister {
    path: PathBuf,
    period: Duration,
}

impl ConfigPersister {
    pub fn new(path: PathBuf, period: Duration) -> Self {
        Self { path, period }
    }

    pub fn spawn(self, config: Arc<ArcSwap<RouterConfig>>, dirty: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            loop {
                ticker.tick().await;
                if dirty.swap(false, Ordering::AcqRel) {
                    let snapshot = config.load_full();
                    match snapshot.save(&self.path) {
                        Ok(()) => tracing::info!(path = %self.path.display(), "persisted router configuration"),
                        Err(e) => {
                            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist router configuration");
                            dirty.store(true, Ordering::Release);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dirty_flag_triggers_a_write_and_clears_itself() {
        let dir = std::env::temp_dir().join(format!("router_config_persist_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("router_config.json");

        let config = Arc::new(ArcSwap::new(Arc::new(RouterConfig::default())));
        let dirty = Arc::new(AtomicBool::new(true));
        let persister = ConfigPersister::new(path.clone(), Duration::from_millis(10));
        let handle = persister.spawn(config, dirty.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(path.exists());
        assert!(!dirty.load(Ordering::Acquire));

        handle.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn a_clean_flag_never_touches_the_file() {
        let dir = std::env::temp_dir().join(format!("router_config_persist_clean_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("router_config.json");

        let config = Arc::new(ArcSwap::new(Arc::new(RouterConfig::default())));
        let dirty = Arc::new(AtomicBool::new(false));
        let persister = ConfigPersister::new(path.clone(), Duration::from_millis(10));
        let handle = persister.spawn(config, dirty);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!path.exists());

        handle.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
