use super::CancelToken;
use crate::error::{Result, SkillDbError};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Waits wake at least this often to notice cancellation.
const POLL: Duration = Duration::from_millis(10);

/// Something a writer holds exclusively until it commits or rolls back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Row {
        entity: String,
        id: String,
    },
    /// A value of a unique constraint, held while inserting or upserting it.
    Unique {
        entity: String,
        constraint: String,
        key: String,
    },
}

impl LockKey {
    pub fn row(entity: &str, id: &str) -> Self {
        LockKey::Row {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn unique(entity: &str, constraint: &str, key: String) -> Self {
        LockKey::Unique {
            entity: entity.to_string(),
            constraint: constraint.to_string(),
            key,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Row { entity, id } => write!(f, "{entity}/{id}"),
            LockKey::Unique {
                entity, constraint, ..
            } => write!(f, "{entity}.{constraint}"),
        }
    }
}

/// Exclusive, reentrant per-transaction locks. Writers touching different
/// rows never wait on each other.
#[derive(Default)]
pub struct LockManager {
    owners: Mutex<HashMap<LockKey, u64>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key` for transaction `tx`, waiting until `deadline` at most.
    pub fn acquire(
        &self,
        key: &LockKey,
        tx: u64,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let mut owners = self
            .owners
            .lock()
            .map_err(|_| SkillDbError::poisoned("lock table"))?;
        loop {
            match owners.get(key) {
                None => {
                    owners.insert(key.clone(), tx);
                    return Ok(());
                }
                Some(owner) if *owner == tx => return Ok(()),
                Some(owner) => {
                    if cancel.is_some_and(CancelToken::is_cancelled) {
                        return Err(SkillDbError::Cancelled);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SkillDbError::TransactionTimeout(format!(
                            "waiting for {key} held by transaction {owner}"
                        )));
                    }
                    log::debug!("transaction {tx} waiting for {key} held by {owner}");
                    let wait = (deadline - now).min(POLL);
                    owners = self
                        .released
                        .wait_timeout(owners, wait)
                        .map_err(|_| SkillDbError::poisoned("lock table"))?
                        .0;
                }
            }
        }
    }

    /// Release everything `tx` holds. Runs on drop paths, so a poisoned
    /// table is recovered rather than reported.
    pub fn release_all(&self, tx: u64, keys: &[LockKey]) {
        if keys.is_empty() {
            return;
        }
        let mut owners = match self.owners.lock() {
            Ok(owners) => owners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in keys {
            if owners.get(key) == Some(&tx) {
                owners.remove(key);
            }
        }
        drop(owners);
        self.released.notify_all();
    }

    pub fn held_count(&self) -> usize {
        self.owners.lock().map(|o| o.len()).unwrap_or(0)
    }
}

/// Bounds how many transactions run at once.
pub struct Admission {
    active: Mutex<usize>,
    freed: Condvar,
    limit: usize,
}

/// A transaction slot, returned on drop.
pub struct Permit {
    admission: Arc<Admission>,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        Admission {
            active: Mutex::new(0),
            freed: Condvar::new(),
            limit: limit.max(1),
        }
    }

    pub fn acquire(
        self: &Arc<Self>,
        max_wait: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Permit> {
        let deadline = Instant::now() + max_wait;
        let mut active = self
            .active
            .lock()
            .map_err(|_| SkillDbError::poisoned("admission"))?;
        while *active >= self.limit {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(SkillDbError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SkillDbError::TransactionTimeout(format!(
                    "no transaction slot free within {max_wait:?}"
                )));
            }
            active = self
                .freed
                .wait_timeout(active, (deadline - now).min(POLL))
                .map_err(|_| SkillDbError::poisoned("admission"))?
                .0;
        }
        *active += 1;
        Ok(Permit {
            admission: Arc::clone(self),
        })
    }

    pub fn active(&self) -> usize {
        self.active.lock().map(|a| *a).unwrap_or(0)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut active = match self.admission.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active = active.saturating_sub(1);
        drop(active);
        self.admission.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::thread;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_locks_are_reentrant_and_exclusive() {
        let locks = LockManager::new();
        let key = LockKey::row("User", "u1");
        locks.acquire(&key, 1, soon(100), None).unwrap();
        locks.acquire(&key, 1, soon(100), None).unwrap();

        let err = locks.acquire(&key, 2, soon(30), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionTimeout);

        locks.release_all(1, &[key.clone()]);
        locks.acquire(&key, 2, soon(30), None).unwrap();
        assert_eq!(locks.held_count(), 1);
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let locks = LockManager::new();
        let key = LockKey::unique("User", "email", "s:a@x.com".into());
        locks.acquire(&key, 1, soon(100), None).unwrap();
        thread::scope(|s| {
            let waiter = s.spawn(|| locks.acquire(&key, 2, soon(2000), None));
            thread::sleep(Duration::from_millis(30));
            locks.release_all(1, &[key.clone()]);
            waiter.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_cancelled_wait() {
        let locks = LockManager::new();
        let key = LockKey::row("Skill", "k1");
        locks.acquire(&key, 1, soon(100), None).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = locks.acquire(&key, 2, soon(1000), Some(&token)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_admission_limit() {
        let admission = Arc::new(Admission::new(1));
        let first = admission.acquire(Duration::from_millis(10), None).unwrap();
        let err = admission
            .acquire(Duration::from_millis(20), None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::TransactionTimeout);
        drop(first);
        assert_eq!(admission.active(), 0);
        let _second = admission.acquire(Duration::from_millis(10), None).unwrap();
        assert_eq!(admission.active(), 1);
    }
}
