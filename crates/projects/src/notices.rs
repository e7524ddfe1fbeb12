//! Progress and outcome messages for running operations.
//!
//! A notice starts as `Loading` with no expiry. Settling it sets the terminal
//! level and starts a fixed countdown after which it disappears regardless of
//! anything else that happens.

use std::time::Duration;

use {serde::Serialize, tokio::time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub message: String,
    pub level: NoticeLevel,
    pub expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct Notices {
    next_id: u64,
    items: Vec<Notice>,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl Default for Notices {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000), Duration::from_millis(3000))
    }
}

impl Notices {
    pub fn new(success_ttl: Duration, failure_ttl: Duration) -> Self {
        Self {
            next_id: 0,
            items: Vec::new(),
            success_ttl,
            failure_ttl,
        }
    }

    pub fn start(&mut self, message: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.items.push(Notice {
            id,
            message: message.into(),
            level: NoticeLevel::Loading,
            expires_at: None,
        });
        id
    }

    /// Give notice `id` its final level and message. An already expired
    /// notice comes back as a fresh one.
    pub fn settle(&mut self, id: u64, level: NoticeLevel, message: impl Into<String>) {
        let ttl = match level {
            NoticeLevel::Error => self.failure_ttl,
            NoticeLevel::Success | NoticeLevel::Loading => self.success_ttl,
        };
        let notice = Notice {
            id,
            message: message.into(),
            level,
            expires_at: Some(Instant::now() + ttl),
        };
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(existing) => *existing = notice,
            None => self.items.push(notice),
        }
    }

    /// Start and settle at once, for outcomes with no loading phase.
    pub fn flash(&mut self, level: NoticeLevel, message: impl Into<String>) -> u64 {
        let message = message.into();
        let id = self.start(message.clone());
        self.settle(id, level, message);
        id
    }

    /// Notices that have not expired yet. Expired ones are pruned.
    pub fn visible(&mut self) -> &[Notice] {
        let now = Instant::now();
        self.items
            .retain(|n| n.expires_at.is_none_or(|deadline| deadline > now));
        &self.items
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn success_expires_after_two_seconds() {
        let mut notices = Notices::default();
        let id = notices.start("Moving 2 folders...");
        notices.settle(id, NoticeLevel::Success, "Moved 2 folders");

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_eq!(notices.visible().len(), 1);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(notices.visible().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_lingers_longer() {
        let mut notices = Notices::default();
        notices.flash(NoticeLevel::Error, "Target exists");
        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(notices.visible()[0].level, NoticeLevel::Error);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(notices.visible().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loading_never_expires() {
        let mut notices = Notices::default();
        notices.start("Importing...");
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(notices.visible()[0].level, NoticeLevel::Loading);
    }
}
