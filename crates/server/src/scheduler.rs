//! Centralized cancel-and-reschedule timers.
//!
//! Every timed behavior (typing expiry today) goes through one
//! scheduler keyed by room + purpose: scheduling a key that is already
//! armed aborts the previous task and starts a fresh countdown, which
//! is exactly the debounce the presence contract needs.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

/// Identifies one scheduled timer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub room_id: String,
    pub purpose: TimerPurpose,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Clear a session's typing indicator after silence
    TypingExpiry { session_id: String },
}

struct Entry {
    generation: u64,
    task: JoinHandle<()>,
}

/// Keyed one-shot timers with cancel-and-reschedule semantics
pub struct TimerScheduler {
    entries: Arc<DashMap<TimerKey, Entry>>,
    generation: AtomicU64,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm (or re-arm) the timer for `key`. Any previously armed task
    /// for the same key is aborted before the new countdown starts.
    pub fn schedule<F>(&self, key: TimerKey, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.clone();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
            // Remove only our own entry; a re-armed timer owns the slot now
            entries.remove_if(&task_key, |_, entry| entry.generation == generation);
        });

        if let Some(old) = self.entries.insert(key, Entry { generation, task }) {
            old.task.abort();
        }
    }

    /// Disarm the timer for `key` if armed.
    pub fn cancel(&self, key: &TimerKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            entry.task.abort();
        }
    }

    #[cfg(test)]
    fn armed(&self, key: &TimerKey) -> bool {
        self.entries.contains_key(key)
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(session: &str) -> TimerKey {
        TimerKey {
            room_id: "room-1".to_string(),
            purpose: TimerPurpose::TypingExpiry {
                session_id: session.to_string(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        scheduler.schedule(key("s-1"), Duration::from_secs(2), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.armed(&key("s-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_cancels_previous_countdown() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = fired.clone();
            scheduler.schedule(key("s-1"), Duration::from_secs(2), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        // Only the last countdown survives
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_disarms() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        scheduler.schedule(key("s-1"), Duration::from_secs(2), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel(&key("s-1"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_are_independent() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for session in ["s-1", "s-2"] {
            let counter = fired.clone();
            scheduler.schedule(key(session), Duration::from_secs(2), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
