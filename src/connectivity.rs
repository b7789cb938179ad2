//! Connectivity observer and reachability probe.
//!
//! The observer combines the platform-reported network state with a manual
//! force-offline override and broadcasts the composite online flag over a
//! `watch` channel. The probe stands in for the platform network-state API:
//! it polls the API base URL and feeds the result into the observer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Request timeout for a single reachability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform-reported network state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    /// An interface is up.
    pub is_connected: bool,
    /// `None` while reachability has not been determined yet.
    pub is_internet_reachable: Option<bool>,
    /// Connection type label ("wifi", "cellular", "http", "none", ...).
    #[serde(rename = "type")]
    pub kind: String,
}

impl ConnectivityState {
    pub fn online(kind: &str) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
            kind: kind.to_string(),
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Some(false),
            kind: "none".to_string(),
        }
    }

    /// Initial state before the first probe: assume connected, reachability unknown.
    pub fn unknown() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: None,
            kind: "unknown".to_string(),
        }
    }

    /// Reachable `false` forces offline even when an interface is up.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable != Some(false)
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Composite online/offline state shared by the API client and the sync daemon.
pub struct ConnectivityObserver {
    state: RwLock<ConnectivityState>,
    forced_offline: AtomicBool,
    online_tx: watch::Sender<bool>,
}

impl ConnectivityObserver {
    pub fn new(initial: ConnectivityState) -> Self {
        let (online_tx, _) = watch::channel(initial.is_online());
        Self {
            state: RwLock::new(initial),
            forced_offline: AtomicBool::new(false),
            online_tx,
        }
    }

    /// Whether outbound calls should be attempted right now.
    pub fn is_online(&self) -> bool {
        !self.is_forced_offline() && self.snapshot().is_online()
    }

    pub fn is_forced_offline(&self) -> bool {
        self.forced_offline.load(Ordering::SeqCst)
    }

    /// Manual override, independent of the real network state.
    pub fn force_offline(&self, forced: bool) {
        let previous = self.forced_offline.swap(forced, Ordering::SeqCst);
        if previous != forced {
            log::info!("Force-offline {}", if forced { "enabled" } else { "disabled" });
        }
        self.publish();
    }

    /// Feed a new platform/probe observation.
    pub fn update(&self, next: ConnectivityState) {
        {
            let mut state = match self.state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *state == next {
                return;
            }
            log::debug!("Connectivity changed: {:?} -> {:?}", *state, next);
            *state = next;
        }
        self.publish();
    }

    pub fn snapshot(&self) -> ConnectivityState {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Receiver of the composite online flag. Only transitions are broadcast.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    fn publish(&self) {
        let online = self.is_online();
        self.online_tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            if online {
                log::info!("Network: ONLINE");
            } else {
                log::warn!("Network: OFFLINE");
            }
            *current = online;
            true
        });
    }
}

impl Default for ConnectivityObserver {
    fn default() -> Self {
        Self::new(ConnectivityState::unknown())
    }
}

/// Probe `url` once. Any HTTP response counts as reachable.
pub async fn probe_once(client: &reqwest::Client, url: &str) -> ConnectivityState {
    match client.head(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(_) => ConnectivityState::online("http"),
        Err(e) if e.is_timeout() => ConnectivityState {
            is_connected: true,
            is_internet_reachable: Some(false),
            kind: "http".to_string(),
        },
        Err(e) => {
            log::debug!("Reachability probe failed: {}", e);
            ConnectivityState::offline()
        }
    }
}

/// Spawn the polling probe. The first probe runs immediately.
pub fn spawn_probe(
    observer: Arc<ConnectivityObserver>,
    client: reqwest::Client,
    url: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!(
            "Reachability probe started for {} (interval: {}s)",
            url,
            interval.as_secs()
        );
        loop {
            ticker.tick().await;
            let state = probe_once(&client, &url).await;
            observer.update(state);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reachable_false_forces_offline() {
        let state = ConnectivityState {
            is_connected: true,
            is_internet_reachable: Some(false),
            kind: "wifi".to_string(),
        };
        assert!(!state.is_online());
        assert!(ConnectivityState::unknown().is_online());
        assert!(!ConnectivityState::offline().is_online());
    }

    #[test]
    fn test_force_offline_overrides_platform_state() {
        let observer = ConnectivityObserver::new(ConnectivityState::online("wifi"));
        assert!(observer.is_online());

        observer.force_offline(true);
        assert!(!observer.is_online());
        observer.update(ConnectivityState::online("cellular"));
        assert!(!observer.is_online());

        observer.force_offline(false);
        assert!(observer.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let observer = ConnectivityObserver::new(ConnectivityState::offline());
        let mut rx = observer.subscribe();
        assert!(!*rx.borrow());

        observer.update(ConnectivityState::online("wifi"));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        observer.force_offline(true);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }

    #[test]
    fn test_no_broadcast_without_transition() {
        let observer = ConnectivityObserver::new(ConnectivityState::online("wifi"));
        let rx = observer.subscribe();
        observer.update(ConnectivityState::online("cellular"));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(observer.snapshot().kind, "cellular");
    }

    #[tokio::test]
    async fn test_probe_unreachable_host_reports_offline() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = reqwest::Client::new();
        let state = probe_once(&client, &format!("http://127.0.0.1:{}/", port)).await;
        assert!(!state.is_online());
    }
}
