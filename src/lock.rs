//! In-memory mutual exclusion keyed by repository name.
//!
//! At most one build runs per repository at a time. Acquisition is
//! non-blocking: a second `lock` on a held key fails immediately rather
//! than queueing. A nonzero timeout lets a later acquirer reclaim a lock
//! whose holder never released it.

use crate::errors::LockError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

/// Process-wide repository lock registry. Never persisted; state dies
/// with the process.
pub struct RepositoryLock {
    held: DashMap<String, Instant>,
    timeout: Duration,
}

impl RepositoryLock {
    /// Create a lock registry. A `timeout` of zero disables stale-lock
    /// reclamation: locks live until explicitly unlocked.
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: DashMap::new(),
            timeout,
        }
    }

    /// Acquire the lock for `repo`. Fails with [`LockError::AlreadyLocked`]
    /// when the key is held and not yet timed out.
    pub fn lock(&self, repo: &str) -> Result<(), LockError> {
        match self.held.entry(repo.to_string()) {
            Entry::Occupied(mut entry) => {
                if !self.timeout.is_zero() && entry.get().elapsed() >= self.timeout {
                    tracing::warn!(repo, "reclaiming stale repository lock");
                    entry.insert(Instant::now());
                    Ok(())
                } else {
                    Err(LockError::AlreadyLocked {
                        repo: repo.to_string(),
                    })
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                Ok(())
            }
        }
    }

    /// Release the lock for `repo`. Fails with [`LockError::NotLocked`]
    /// when the key has no current holder.
    pub fn unlock(&self, repo: &str) -> Result<(), LockError> {
        match self.held.remove(repo) {
            Some(_) => Ok(()),
            None => Err(LockError::NotLocked {
                repo: repo.to_string(),
            }),
        }
    }

    /// Acquire the lock, run `f`, and release afterward regardless of how
    /// `f` exits. When the lock cannot be acquired, `f` is never started.
    pub async fn wrap<T, Fut>(&self, repo: &str, f: impl FnOnce() -> Fut) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        self.lock(repo)?;
        let _guard = UnlockGuard { lock: self, repo };
        Ok(f().await)
    }
}

struct UnlockGuard<'a> {
    lock: &'a RepositoryLock,
    repo: &'a str,
}

impl Drop for UnlockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock(self.repo) {
            tracing::warn!(repo = self.repo, %err, "releasing repository lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_held_key_fails() {
        let lck = RepositoryLock::new(Duration::ZERO);
        assert!(lck.lock("repo1").is_ok());
        assert_eq!(
            lck.lock("repo1"),
            Err(LockError::AlreadyLocked {
                repo: "repo1".to_string()
            })
        );
    }

    #[test]
    fn lock_succeeds_again_after_unlock() {
        let lck = RepositoryLock::new(Duration::ZERO);
        assert!(lck.lock("fakeid").is_ok());
        assert!(lck.unlock("fakeid").is_ok());
        assert!(lck.lock("fakeid").is_ok());
    }

    #[test]
    fn unlock_of_never_locked_key_fails() {
        let lck = RepositoryLock::new(Duration::ZERO);
        assert_eq!(
            lck.unlock("fakeid"),
            Err(LockError::NotLocked {
                repo: "fakeid".to_string()
            })
        );
    }

    #[test]
    fn double_unlock_fails() {
        let lck = RepositoryLock::new(Duration::ZERO);
        assert!(lck.lock("fakeid").is_ok());
        assert!(lck.unlock("fakeid").is_ok());
        assert!(lck.unlock("fakeid").is_err());
    }

    #[test]
    fn different_keys_lock_independently() {
        let lck = RepositoryLock::new(Duration::ZERO);
        assert!(lck.lock("repo1").is_ok());
        assert!(lck.lock("repo2").is_ok());
        assert!(lck.unlock("repo1").is_ok());
        assert!(lck.unlock("repo2").is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimed_after_timeout() {
        let lck = RepositoryLock::new(Duration::from_millis(10));
        assert!(lck.lock("repo1").is_ok());
        std::thread::sleep(Duration::from_millis(20));
        assert!(lck.lock("repo1").is_ok());
        assert!(lck.unlock("repo1").is_ok());
    }

    #[test]
    fn zero_timeout_never_reclaims() {
        let lck = RepositoryLock::new(Duration::ZERO);
        assert!(lck.lock("repo1").is_ok());
        std::thread::sleep(Duration::from_millis(20));
        assert!(lck.lock("repo1").is_err());
    }

    #[tokio::test]
    async fn wrap_releases_on_success_and_error() {
        let lck = RepositoryLock::new(Duration::from_secs(100));
        let out = lck.wrap("repo", || async { 42 }).await;
        assert_eq!(out, Ok(42));

        assert!(lck.lock("repo").is_ok());
        let blocked = lck.wrap("repo", || async { 0 }).await;
        assert_eq!(
            blocked,
            Err(LockError::AlreadyLocked {
                repo: "repo".to_string()
            })
        );
        assert!(lck.unlock("repo").is_ok());

        let out = lck.wrap("repo", || async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn wrap_never_runs_the_operation_when_contended() {
        let lck = RepositoryLock::new(Duration::ZERO);
        assert!(lck.lock("repo").is_ok());
        let mut ran = false;
        let res = lck
            .wrap("repo", || {
                ran = true;
                async { () }
            })
            .await;
        assert!(res.is_err());
        assert!(!ran);
    }
}
