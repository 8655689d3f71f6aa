//! Network reachability signal
//!
//! Holds the client's "online" flag and publishes every transition on a
//! watch channel so listeners can react to reconnects.

use crate::remote::{RemoteError, RemoteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag; listeners are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            tracing::info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Go offline when a remote call failed without reaching the remote.
    /// Returns whether the flag was lowered.
    pub fn record_failure(&self, err: &RemoteError) -> bool {
        if err.is_unreachable() && self.is_online() {
            tracing::warn!("Remote unreachable, going offline: {}", err);
            self.set_online(false);
            return true;
        }
        false
    }

    /// Ping the remote and set the flag from the outcome
    pub async fn check(&self, remote: &dyn RemoteStore) -> bool {
        let online = match remote.ping().await {
            Ok(()) => true,
            Err(err) => !err.is_unreachable(),
        };
        self.set_online(online);
        online
    }

    /// While offline, ping the remote every `interval` until it answers.
    pub fn spawn_reachability_monitor(
        &self,
        remote: Arc<dyn RemoteStore>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let connectivity = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                if !connectivity.is_online() && connectivity.check(remote.as_ref()).await {
                    tracing::debug!("Remote reachable again");
                }
            }
        })
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;

    #[tokio::test]
    async fn test_transitions_notify_subscribers() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn test_only_unreachable_failures_go_offline() {
        let connectivity = Connectivity::new(true);

        assert!(!connectivity.record_failure(&RemoteError::from_status(503, "down")));
        assert!(connectivity.is_online());

        assert!(connectivity.record_failure(&RemoteError::connectivity("no route")));
        assert!(!connectivity.is_online());
    }

    #[tokio::test]
    async fn test_monitor_restores_online_flag() {
        let remote = InMemoryRemote::new();
        remote.set_offline(true);
        let connectivity = Connectivity::new(false);

        let monitor = connectivity
            .spawn_reachability_monitor(Arc::new(remote.clone()), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!connectivity.is_online());

        remote.set_offline(false);
        for _ in 0..50 {
            if connectivity.is_online() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(connectivity.is_online());
        monitor.abort();
    }

    #[tokio::test]
    async fn test_same_value_does_not_notify() {
        let connectivity = Connectivity::new(true);
        let rx = connectivity.subscribe();

        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
