//! Upload concurrency bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use thiserror::Error;

use crate::domain::entities::Identity;

/// Global cap on concurrent uploads, acquired with compare-and-swap.
#[derive(Debug, Clone)]
pub struct UploadSlots {
    active: Arc<AtomicUsize>,
    cap: usize,
}

impl UploadSlots {
    pub fn new(cap: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            cap,
        }
    }

    /// Take a slot, or `None` when all are busy.
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.cap {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SlotGuard {
                        active: Arc::clone(&self.active),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Releases its slot when dropped, including during unwinding.
#[derive(Debug)]
pub struct SlotGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Identities with an upload running in this process.
#[derive(Default, Clone)]
pub struct InFlightUploads {
    identities: Arc<DashMap<Identity, ()>>,
}

#[derive(Debug, Error)]
pub enum InFlightError {
    #[error("upload already in progress for identity {identity}")]
    AlreadyRunning { identity: Identity },
}

impl InFlightUploads {
    pub fn new() -> Self {
        Self {
            identities: Arc::new(DashMap::new()),
        }
    }

    pub fn acquire(&self, identity: Identity) -> Result<InFlightGuard, InFlightError> {
        use dashmap::mapref::entry::Entry;

        match self.identities.entry(identity) {
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(InFlightGuard {
                    identity,
                    identities: Arc::clone(&self.identities),
                })
            }
            Entry::Occupied(_) => Err(InFlightError::AlreadyRunning { identity }),
        }
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.identities.contains_key(&identity)
    }
}

pub struct InFlightGuard {
    identity: Identity,
    identities: Arc<DashMap<Identity, ()>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.identities.remove(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn slots_respect_cap_and_release_on_drop() {
        let slots = UploadSlots::new(2);
        let first = slots.try_acquire().expect("first slot");
        let _second = slots.try_acquire().expect("second slot");
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.in_use(), 2);

        drop(first);
        assert_eq!(slots.in_use(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn slot_is_released_when_holder_panics() {
        let slots = UploadSlots::new(1);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = slots.try_acquire().expect("slot");
            panic!("upload blew up");
        }));
        assert!(result.is_err());
        assert_eq!(slots.in_use(), 0);
    }

    #[test]
    fn in_flight_rejects_duplicates_until_released() {
        let uploads = InFlightUploads::new();
        let guard = uploads.acquire(7).expect("first acquire");
        assert!(matches!(
            uploads.acquire(7),
            Err(InFlightError::AlreadyRunning { identity: 7 })
        ));
        assert!(uploads.contains(7));

        drop(guard);
        assert!(!uploads.contains(7));
        assert!(uploads.acquire(7).is_ok());
    }
}
