use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use uuid::Uuid;

pub const DEFAULT_NOTICE_DURATION: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: Uuid,
    pub kind: NoticeKind,
    pub message: String,
    pub duration: Duration,
    pub posted_at: Instant,
}

impl Notice {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.posted_at) >= self.duration
    }
}

/// User-facing notices waiting to be shown. Passed into whatever produces
/// them, so tests can inspect what a user would have seen.
#[derive(Debug, Default)]
pub struct NoticeQueue {
    notices: Mutex<Vec<Notice>>,
}

impl NoticeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn notices(&self) -> MutexGuard<'_, Vec<Notice>> {
        self.notices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, kind: NoticeKind, message: impl Into<String>) -> Uuid {
        self.push_for(kind, message, DEFAULT_NOTICE_DURATION)
    }

    pub fn push_for(&self, kind: NoticeKind, message: impl Into<String>, duration: Duration) -> Uuid {
        let notice = Notice {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            duration,
            posted_at: Instant::now(),
        };
        let id = notice.id;
        self.notices().push(notice);
        id
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut notices = self.notices();
        let before = notices.len();
        notices.retain(|notice| notice.id != id);
        notices.len() != before
    }

    pub fn clear(&self) {
        self.notices().clear();
    }

    /// Notices still on screen at `now`; expired ones are dropped.
    pub fn active_at(&self, now: Instant) -> Vec<Notice> {
        let mut notices = self.notices();
        notices.retain(|notice| !notice.is_expired_at(now));
        notices.clone()
    }

    pub fn active(&self) -> Vec<Notice> {
        self.active_at(Instant::now())
    }

    pub fn latest(&self) -> Option<Notice> {
        self.notices().last().cloned()
    }
}
