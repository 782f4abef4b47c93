//! Local status monitor: turns location fixes into Self status updates.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::model::{self, Status, FULL_PRECISION};
use crate::store::DataStore;

const LOCATION_CHANNEL_CAPACITY: usize = 16;

/// A position report from the platform's location provider.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    pub longitude: f64,
    pub latitude: f64,
    /// Reverse-geocoded label for the fix
    pub address: String,
}

/// Platform location provider collaborator.
pub trait LocationSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<LocationFix>;
}

/// In-process [`LocationSource`] fed by whoever owns the platform API.
#[derive(Debug, Clone)]
pub struct ChannelLocationSource {
    sender: broadcast::Sender<LocationFix>,
}

impl ChannelLocationSource {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCATION_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, fix: LocationFix) {
        let _ = self.sender.send(fix);
    }
}

impl Default for ChannelLocationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationSource for ChannelLocationSource {
    fn subscribe(&self) -> broadcast::Receiver<LocationFix> {
        self.sender.subscribe()
    }
}

/// Running monitor task. Stops when dropped or via [`StatusMonitor::stop`].
pub struct StatusMonitor {
    task: JoinHandle<()>,
}

impl StatusMonitor {
    /// Start writing a precision-limited self status for every fix.
    pub fn start(source: &dyn LocationSource, store: Arc<DataStore>, precision: i32) -> Self {
        let mut fixes = source.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let fix = match fixes.recv().await {
                    Ok(fix) => fix,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Location monitor skipped stale fixes");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let status = Status::new(
                    model::now(),
                    fix.longitude,
                    fix.latitude,
                    FULL_PRECISION,
                    fix.address,
                )
                .limit_precision(precision);

                if let Err(e) = store.update_self_status(status).await {
                    warn!(error = %e, "Failed to record new self location");
                }
            }
        });
        Self { task }
    }

    pub fn stop(self) {}
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventBus};

    #[tokio::test]
    async fn test_fix_becomes_limited_self_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::open(dir.path(), EventBus::new()).await.unwrap());
        let mut events = store.events().subscribe();
        let source = ChannelLocationSource::new();
        let monitor = StatusMonitor::start(&source, store.clone(), 1);

        source.publish(LocationFix {
            longitude: 2.294_48,
            latitude: 48.858_37,
            address: "France".into(),
        });

        assert_eq!(events.recv().await, Some(Event::StatusUpdated));
        let status = store.get_self_status().await.unwrap();
        assert_eq!(status.precision, 1);
        assert_eq!(status.longitude, 2.3);
        assert_eq!(status.latitude, 48.9);
        assert_eq!(status.street_address, "France");
        monitor.stop();
    }

    #[tokio::test]
    async fn test_stopped_monitor_ignores_fixes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::open(dir.path(), EventBus::new()).await.unwrap());
        let source = ChannelLocationSource::new();
        let monitor = StatusMonitor::start(&source, store.clone(), FULL_PRECISION);
        monitor.stop();
        tokio::task::yield_now().await;

        source.publish(LocationFix {
            longitude: 0.0,
            latitude: 0.0,
            address: String::new(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(store.get_self_status().await.unwrap_err().is_not_found());
    }
}
