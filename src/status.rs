//! Sync status shown next to the pending-count badge.

/// All possible states of the background sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    /// Daemon started, no pass has run yet.
    Idle,
    /// A drain pass is running.
    Syncing,
    /// Last pass completed with nothing left failing.
    Synced,
    /// Network unavailable (or forced offline); waiting for connectivity.
    Offline,
    /// Last pass left failed or dead-lettered mutations.
    Error(String),
}

impl SyncStatus {
    /// Human-readable status text.
    pub fn label(&self) -> &str {
        match self {
            SyncStatus::Idle => "Idle",
            SyncStatus::Syncing => "Syncing...",
            SyncStatus::Synced => "Synced",
            SyncStatus::Offline => "Offline",
            SyncStatus::Error(_) => "Error",
        }
    }

    /// Badge text: the label, plus the pending count when there is one.
    pub fn badge(&self, pending: usize) -> String {
        if pending == 0 {
            self.label().to_string()
        } else {
            format!("{} ({} pending)", self.label(), pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(SyncStatus::Idle.label(), "Idle");
        assert_eq!(SyncStatus::Syncing.label(), "Syncing...");
        assert_eq!(SyncStatus::Synced.label(), "Synced");
        assert_eq!(SyncStatus::Offline.label(), "Offline");
        assert_eq!(SyncStatus::Error("2 failed".into()).label(), "Error");
    }

    #[test]
    fn test_badge() {
        assert_eq!(SyncStatus::Synced.badge(0), "Synced");
        assert_eq!(SyncStatus::Offline.badge(3), "Offline (3 pending)");
    }
}
