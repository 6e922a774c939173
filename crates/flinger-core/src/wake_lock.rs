//! Per-thread wake lock with UID attribution
//!
//! A worker thread holds one wake lock while any client track is active.
//! The lock is reference counted per UID: it is taken when the first UID
//! becomes active and dropped when the last one goes away. The power
//! service is told which UIDs the lock is held for so battery usage can be
//! blamed on the right clients.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::FlingerResult;
use crate::types::Uid;

/// Opaque handle for a wake lock held with a [`PowerManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeLockToken(pub u64);

/// System power service
pub trait PowerManager: Send + Sync {
    fn acquire_wake_lock(&self, tag: &str, uids: &[Uid]) -> FlingerResult<WakeLockToken>;
    fn update_wake_lock_uids(&self, token: WakeLockToken, uids: &[Uid]);
    fn release_wake_lock(&self, token: WakeLockToken);
}

/// Reference-counted wake lock state of one worker thread
pub struct WakeLock {
    tag: String,
    power: Option<Arc<dyn PowerManager>>,
    token: Option<WakeLockToken>,
    uids: BTreeMap<Uid, u32>,
}

impl WakeLock {
    /// `power` may be `None` when wake locks are disabled; counting still happens
    pub fn new(tag: impl Into<String>, power: Option<Arc<dyn PowerManager>>) -> Self {
        Self {
            tag: tag.into(),
            power,
            token: None,
            uids: BTreeMap::new(),
        }
    }

    /// Count one more active track for `uid`
    pub fn acquire(&mut self, uid: Uid) {
        let was_empty = self.uids.is_empty();
        let count = self.uids.entry(uid).or_insert(0);
        *count += 1;
        let new_uid = *count == 1;

        if was_empty {
            self.take();
        } else if new_uid {
            self.update();
        }
    }

    /// Count one less active track for `uid`; unknown UIDs are ignored
    pub fn release(&mut self, uid: Uid) {
        let Some(count) = self.uids.get_mut(&uid) else {
            log::warn!("{}: wake lock release for unknown uid {}", self.tag, uid.0);
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.uids.remove(&uid);
        if self.uids.is_empty() {
            self.drop_lock();
        } else {
            self.update();
        }
    }

    /// Drop every reference at once (thread exit or standby with no tracks)
    pub fn release_all(&mut self) {
        self.uids.clear();
        self.drop_lock();
    }

    /// Held iff at least one UID is active
    #[inline]
    pub fn is_held(&self) -> bool {
        !self.uids.is_empty()
    }

    pub fn uids(&self) -> Vec<Uid> {
        self.uids.keys().copied().collect()
    }

    fn take(&mut self) {
        let uids = self.uids();
        if let Some(power) = &self.power {
            match power.acquire_wake_lock(&self.tag, &uids) {
                Ok(token) => self.token = Some(token),
                Err(e) => log::warn!("{}: cannot acquire wake lock: {}", self.tag, e),
            }
        }
        log::debug!("{}: wake lock acquired for {:?}", self.tag, uids);
    }

    fn update(&self) {
        if let (Some(power), Some(token)) = (&self.power, self.token) {
            power.update_wake_lock_uids(token, &self.uids());
        }
    }

    fn drop_lock(&mut self) {
        if let (Some(power), Some(token)) = (&self.power, self.token.take()) {
            power.release_wake_lock(token);
        }
        log::debug!("{}: wake lock released", self.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPower {
        log: Mutex<Vec<String>>,
    }

    impl PowerManager for RecordingPower {
        fn acquire_wake_lock(&self, tag: &str, uids: &[Uid]) -> FlingerResult<WakeLockToken> {
            self.log.lock().unwrap().push(format!("acquire {} {:?}", tag, uids));
            Ok(WakeLockToken(7))
        }
        fn update_wake_lock_uids(&self, token: WakeLockToken, uids: &[Uid]) {
            self.log.lock().unwrap().push(format!("update {} {:?}", token.0, uids));
        }
        fn release_wake_lock(&self, token: WakeLockToken) {
            self.log.lock().unwrap().push(format!("release {}", token.0));
        }
    }

    #[test]
    fn test_held_until_last_uid_released() {
        let mut lock = WakeLock::new("out", None);
        lock.acquire(Uid(1));
        lock.acquire(Uid(2));
        lock.release(Uid(1));
        assert!(lock.is_held());
        lock.release(Uid(2));
        assert!(!lock.is_held());
    }

    #[test]
    fn test_same_uid_counts_twice() {
        let mut lock = WakeLock::new("out", None);
        lock.acquire(Uid(3));
        lock.acquire(Uid(3));
        lock.release(Uid(3));
        assert!(lock.is_held());
        lock.release(Uid(3));
        assert!(!lock.is_held());
    }

    #[test]
    fn test_power_manager_sees_uid_set() {
        let power = Arc::new(RecordingPower::default());
        let mut lock = WakeLock::new("out", Some(power.clone()));
        lock.acquire(Uid(1));
        lock.acquire(Uid(2));
        lock.release(Uid(1));
        lock.release(Uid(2));
        let log = power.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "acquire out [Uid(1)]".to_string(),
                "update 7 [Uid(1), Uid(2)]".to_string(),
                "update 7 [Uid(2)]".to_string(),
                "release 7".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_release_is_ignored() {
        let mut lock = WakeLock::new("out", None);
        lock.release(Uid(9));
        assert!(!lock.is_held());
    }
}
