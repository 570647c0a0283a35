//! Process-wide single-flight guards
//!
//! Launching and container staging may each run at most once at a time. The
//! launcher owns one [`GuardRegistry`] for the whole process. Each is a
//! compare-and-swap flag; acquiring returns a [`FlagGuard`] that releases the
//! flag when dropped, including on early return and panic.

use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Launch,
    Staging,
}

impl OperationKind {
    fn busy_error(&self) -> Error {
        match self {
            OperationKind::Launch => Error::LaunchInProgress,
            OperationKind::Staging => Error::StagingInProgress,
        }
    }
}

#[derive(Debug, Default)]
pub struct GuardRegistry {
    launch: AtomicBool,
    staging: AtomicBool,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, kind: OperationKind) -> &AtomicBool {
        match kind {
            OperationKind::Launch => &self.launch,
            OperationKind::Staging => &self.staging,
        }
    }

    /// Take the flag for `kind`, or fail immediately if it is held
    pub fn try_acquire(&self, kind: OperationKind) -> Result<FlagGuard<'_>> {
        self.flag(kind)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| kind.busy_error())?;
        Ok(FlagGuard {
            flag: self.flag(kind),
        })
    }

    pub fn is_held(&self, kind: OperationKind) -> bool {
        self.flag(kind).load(Ordering::Acquire)
    }
}

/// Releases its flag on drop
#[derive(Debug)]
pub struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected() {
        let registry = GuardRegistry::new();
        let guard = registry.try_acquire(OperationKind::Staging).unwrap();
        assert!(matches!(
            registry.try_acquire(OperationKind::Staging),
            Err(Error::StagingInProgress)
        ));
        assert!(registry.try_acquire(OperationKind::Launch).is_ok());
        drop(guard);
        assert!(!registry.is_held(OperationKind::Staging));
        assert!(registry.try_acquire(OperationKind::Staging).is_ok());
    }

    #[test]
    fn test_released_on_panic() {
        let registry = GuardRegistry::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = registry.try_acquire(OperationKind::Launch).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!registry.is_held(OperationKind::Launch));
    }

    #[test]
    fn test_launch_busy_error() {
        let registry = GuardRegistry::new();
        let _guard = registry.try_acquire(OperationKind::Launch).unwrap();
        assert!(matches!(
            registry.try_acquire(OperationKind::Launch),
            Err(Error::LaunchInProgress)
        ));
    }
}
