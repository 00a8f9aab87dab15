//! Per-channel advisory locks.
//!
//! One [`tokio::sync::Mutex`] per channel id, created on first reference and
//! never removed. Acquisition hands out an owned [`ChannelGuard`] that can be
//! moved into a background task; the lock is released when the guard is
//! dropped, which also happens while a panicking task unwinds.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Proof that the holder owns the lock for one channel.
///
/// Session mutation requires a reference to this guard, so the compiler
/// enforces that only the lock holder writes a channel's session.
#[derive(Debug)]
pub struct ChannelGuard {
    channel_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl ChannelGuard {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Releases the lock. Equivalent to dropping the guard.
    pub fn unlock(self) {}
}

/// Registry of channel locks.
#[derive(Debug, Default)]
pub struct ChannelLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, channel_id: &str) -> Arc<Mutex<()>> {
        let entry = self
            .locks
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    /// Non-blocking acquire. `None` means another operation is already
    /// running for this channel and the caller must refuse, not queue.
    pub fn try_lock(&self, channel_id: &str) -> Option<ChannelGuard> {
        let guard = self.handle(channel_id).try_lock_owned().ok()?;
        Some(ChannelGuard {
            channel_id: channel_id.to_string(),
            _guard: guard,
        })
    }

    /// Waits until the channel lock is free.
    pub async fn lock(&self, channel_id: &str) -> ChannelGuard {
        let guard = self.handle(channel_id).lock_owned().await;
        ChannelGuard {
            channel_id: channel_id.to_string(),
            _guard: guard,
        }
    }

    /// Whether an operation currently holds the lock for `channel_id`.
    pub fn is_locked(&self, channel_id: &str) -> bool {
        self.locks
            .get(channel_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of channels ever seen.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_try_lock_is_refused() {
        let locks = ChannelLocks::new();
        let first = locks.try_lock("c1").expect("first acquire");
        assert!(locks.try_lock("c1").is_none());
        assert!(locks.is_locked("c1"));
        first.unlock();
        assert!(!locks.is_locked("c1"));
        assert!(locks.try_lock("c1").is_some());
    }

    #[test]
    fn test_channels_are_independent() {
        let locks = ChannelLocks::new();
        let _a = locks.try_lock("a").unwrap();
        let _b = locks.try_lock("b").expect("other channel must not be blocked");
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_unknown_channel_is_unlocked() {
        let locks = ChannelLocks::new();
        assert!(!locks.is_locked("never-seen"));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_guard_released_when_task_panics() {
        let locks = Arc::new(ChannelLocks::new());
        let guard = locks.try_lock("c1").unwrap();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("orchestration blew up");
        });
        assert!(handle.await.is_err());
        assert!(locks.try_lock("c1").is_some());
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let locks = Arc::new(ChannelLocks::new());
        let guard = locks.try_lock("c1").unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.lock("c1").await.channel_id().to_string() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert_eq!(waiter.await.unwrap(), "c1");
    }
}
