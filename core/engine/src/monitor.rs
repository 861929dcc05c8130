//! Connectivity capability.
//!
//! The engine never probes the network itself; it is handed a
//! [`NetworkMonitor`] and reacts to the transitions it reports.

use tokio::sync::watch;

/// Reports the current online/offline state and notifies on transitions.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;

    /// Subscribe to state transitions. The receiver's current value is
    /// the present state.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Monitor with a fixed state. The CLI default (assume online).
pub struct StaticMonitor {
    tx: watch::Sender<bool>,
}

impl StaticMonitor {
    pub fn online() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx }
    }

    pub fn offline() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }
}

impl NetworkMonitor for StaticMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Monitor driven by the embedding application (or tests) reporting
/// connectivity changes explicitly.
pub struct ToggleMonitor {
    tx: watch::Sender<bool>,
}

impl ToggleMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Report a connectivity change. Redundant reports (same state) do
    /// not produce a transition.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|state| {
            let changed = *state != online;
            *state = online;
            changed
        });
    }
}

impl NetworkMonitor for ToggleMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_monitor() {
        assert!(StaticMonitor::online().is_online());
        assert!(!StaticMonitor::offline().is_online());
    }

    #[tokio::test]
    async fn test_toggle_transitions() {
        let monitor = ToggleMonitor::new(false);
        let mut rx = monitor.watch();
        assert!(!*rx.borrow_and_update());

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_redundant_report_is_not_a_transition() {
        let monitor = ToggleMonitor::new(true);
        let mut rx = monitor.watch();
        rx.borrow_and_update();

        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
