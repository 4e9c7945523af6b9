//! Exclusive activity locks
//!
//! A new-content crawl holds its whole AU; a repair crawl holds only the
//! URLs it repairs. An AU lock and a URL lock of the same AU conflict.
//! Locks are released when the [`ActivityLock`] guard is dropped, so every
//! exit path of a crawl releases them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    Au(String),
    Url { au_id: String, url: String },
}

impl LockScope {
    fn au_id(&self) -> &str {
        match self {
            LockScope::Au(id) | LockScope::Url { au_id: id, .. } => id,
        }
    }
}

/// The set of held activity locks, shared by every crawl
#[derive(Debug, Default)]
pub struct ActivityLocks {
    held: Mutex<HashSet<LockScope>>,
}

/// Guard over held locks
#[derive(Debug)]
pub struct ActivityLock {
    locks: Arc<ActivityLocks>,
    scopes: Vec<LockScope>,
}

impl ActivityLock {
    pub fn scopes(&self) -> &[LockScope] {
        &self.scopes
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

impl Drop for ActivityLock {
    fn drop(&mut self) {
        if self.scopes.is_empty() {
            return;
        }
        let mut held = self.locks.lock();
        for scope in &self.scopes {
            held.remove(scope);
        }
        tracing::trace!("Released {} activity lock(s)", self.scopes.len());
    }
}

/// Outcome of locking a set of repair URLs
#[derive(Debug)]
pub struct UrlLocks {
    pub lock: ActivityLock,
    pub locked: Vec<String>,
    pub failed: Vec<String>,
}

impl UrlLocks {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

impl ActivityLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<LockScope>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks a whole AU; fails if the AU or any of its URLs is locked
    pub fn try_lock_au(self: &Arc<Self>, au_id: &str) -> Option<ActivityLock> {
        let mut held = self.lock();
        if held.iter().any(|scope| scope.au_id() == au_id) {
            return None;
        }
        let scope = LockScope::Au(au_id.to_string());
        held.insert(scope.clone());
        Some(ActivityLock {
            locks: self.clone(),
            scopes: vec![scope],
        })
    }

    /// Locks each URL that is free; the rest are reported as failed
    pub fn try_lock_urls(self: &Arc<Self>, au_id: &str, urls: &[String]) -> UrlLocks {
        let mut held = self.lock();
        let au_locked = held.contains(&LockScope::Au(au_id.to_string()));
        let mut scopes = Vec::new();
        let mut locked = Vec::new();
        let mut failed = Vec::new();

        for url in urls {
            let scope = LockScope::Url {
                au_id: au_id.to_string(),
                url: url.clone(),
            };
            if au_locked || held.contains(&scope) {
                failed.push(url.clone());
                continue;
            }
            held.insert(scope.clone());
            scopes.push(scope);
            locked.push(url.clone());
        }

        UrlLocks {
            lock: ActivityLock {
                locks: self.clone(),
                scopes,
            },
            locked,
            failed,
        }
    }

    pub fn is_au_locked(&self, au_id: &str) -> bool {
        self.lock().contains(&LockScope::Au(au_id.to_string()))
    }

    pub fn held_count(&self) -> usize {
        self.lock().len()
    }
}
