use std::time::Duration;

use tokio::time::Instant;

/// How much of a job's progress one polling session has reconciled.
///
/// Lives only as long as the session. Counts never decrease: a backend
/// response with shorter lists than before leaves the cursor where it is.
/// Announcement marks track which list entries already have a log line, so a
/// retried tick never logs the same account twice.
#[derive(Debug, Default)]
pub struct ProgressCursor {
    account_count: u64,
    failure_count: u64,
    announced_accounts: u64,
    announced_failures: u64,
    last_heartbeat: Option<Instant>,
}

impl ProgressCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts already reconciled.
    pub fn account_count(&self) -> u64 {
        self.account_count
    }

    /// Failures already reconciled.
    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn announced_accounts(&self) -> u64 {
        self.announced_accounts
    }

    pub fn announced_failures(&self) -> u64 {
        self.announced_failures
    }

    pub fn advance_accounts(&mut self, to: u64) {
        self.account_count = self.account_count.max(to);
        self.announce_accounts(to);
    }

    pub fn advance_failures(&mut self, to: u64) {
        self.failure_count = self.failure_count.max(to);
        self.announce_failures(to);
    }

    pub fn announce_accounts(&mut self, to: u64) {
        self.announced_accounts = self.announced_accounts.max(to);
    }

    pub fn announce_failures(&mut self, to: u64) {
        self.announced_failures = self.announced_failures.max(to);
    }

    /// Returns true, and restarts the throttle, if a heartbeat may be logged.
    pub fn heartbeat_due(&mut self, now: Instant, interval: Duration) -> bool {
        match self.last_heartbeat {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                self.last_heartbeat = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_never_decrease() {
        let mut cursor = ProgressCursor::new();
        cursor.advance_accounts(3);
        cursor.advance_accounts(1);
        cursor.advance_failures(2);
        cursor.advance_failures(0);

        assert_eq!(cursor.account_count(), 3);
        assert_eq!(cursor.failure_count(), 2);
    }

    #[test]
    fn announcing_does_not_reconcile() {
        let mut cursor = ProgressCursor::new();
        cursor.announce_accounts(4);
        assert_eq!(cursor.announced_accounts(), 4);
        assert_eq!(cursor.account_count(), 0);

        cursor.advance_accounts(2);
        assert_eq!(cursor.announced_accounts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_is_throttled() {
        let mut cursor = ProgressCursor::new();
        let interval = Duration::from_secs(10);

        assert!(cursor.heartbeat_due(Instant::now(), interval));
        assert!(!cursor.heartbeat_due(Instant::now(), interval));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!cursor.heartbeat_due(Instant::now(), interval));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cursor.heartbeat_due(Instant::now(), interval));
    }
}
