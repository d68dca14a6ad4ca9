//! Unprivileged identities for sandboxed programs
//!
//! A root judge hands every concurrent execution its own uid/gid from a
//! fixed pool, so programs can neither touch the judge's files nor signal
//! each other. A non-root judge cannot switch ids and keeps its own inside
//! a user namespace instead.

use std::sync::{Arc, Mutex, PoisonError};

use nix::unistd::{Gid, Uid, getegid, geteuid};
use themis_common::{AppError, AppResult};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Who the program runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Identity {
    /// Same ids as the judge
    Inherit,
    /// Switch to a pooled uid/gid before exec
    Switch { uid: Uid, gid: Gid },
    /// Keep the judge's ids, mapped one-to-one into a new user namespace
    Mapped { uid_map: Vec<u8>, gid_map: Vec<u8> },
}

impl Identity {
    /// Identity mapping of the caller's effective ids.
    pub fn mapped() -> Self {
        let uid = geteuid();
        let gid = getegid();
        Self::Mapped {
            uid_map: format!("{uid} {uid} 1\n").into_bytes(),
            gid_map: format!("{gid} {gid} 1\n").into_bytes(),
        }
    }

    /// The uid files must belong to for the program to write them.
    pub fn owner(&self) -> Option<(Uid, Gid)> {
        match self {
            Self::Switch { uid, gid } => Some((*uid, *gid)),
            _ => None,
        }
    }
}

/// Fixed range of uids leased one per execution
#[derive(Debug)]
pub(crate) struct UidPool {
    free: Arc<Mutex<Vec<u32>>>,
    permits: Arc<Semaphore>,
}

/// A uid held for one execution, returned to the pool on drop
#[derive(Debug)]
pub(crate) struct UidLease {
    uid: u32,
    free: Arc<Mutex<Vec<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl UidPool {
    pub fn new(base: u32, count: u32) -> Self {
        // Popped from the back, so the lowest uid goes first
        let free: Vec<u32> = (base..base.saturating_add(count)).rev().collect();
        Self {
            permits: Arc::new(Semaphore::new(free.len())),
            free: Arc::new(Mutex::new(free)),
        }
    }

    /// Wait for a free uid.
    pub async fn acquire(&self) -> AppResult<UidLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::SandboxError("Uid pool closed".to_string()))?;
        let uid = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| AppError::SandboxError("Uid pool exhausted".to_string()))?;
        Ok(UidLease {
            uid,
            free: self.free.clone(),
            _permit: permit,
        })
    }
}

impl UidLease {
    pub fn identity(&self) -> Identity {
        Identity::Switch {
            uid: Uid::from_raw(self.uid),
            gid: Gid::from_raw(self.uid),
        }
    }
}

impl Drop for UidLease {
    fn drop(&mut self) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_leases_are_distinct_and_returned() {
        let pool = UidPool::new(60_000, 2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(first.uid, 60_000);
        assert_eq!(second.uid, 60_001);

        // Pool is empty until a lease drops
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err());

        drop(first);
        let third = pool.acquire().await.unwrap();
        assert_eq!(third.uid, 60_000);
        assert_eq!(
            third.identity(),
            Identity::Switch {
                uid: Uid::from_raw(60_000),
                gid: Gid::from_raw(60_000),
            }
        );
    }

    #[test]
    fn test_mapped_identity_maps_the_caller() {
        let Identity::Mapped { uid_map, .. } = Identity::mapped() else {
            panic!("expected a mapped identity");
        };
        let uid = geteuid();
        assert_eq!(uid_map, format!("{uid} {uid} 1\n").into_bytes());
        assert!(Identity::mapped().owner().is_none());
    }
}
