//! Registry concurrency guard.
//!
//! A reader/writer lock with an upgradable mode. Shared holders run
//! concurrently; one upgradable holder may coexist with them and convert in
//! place to exclusive, so a check-then-insert never releases the lock between
//! the check and the insert.
//!
//! Every guard releases on drop. Acquisition blocks until granted unless the
//! lock was built with a timeout, in which case it fails with
//! [`Error::LockTimeout`].

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

pub struct RegistryLock<T> {
    inner: RwLock<T>,
    timeout: Option<Duration>,
}

impl<T> RegistryLock<T> {
    /// Create a lock; `timeout` of `None` blocks forever
    pub fn new(value: T, timeout: Option<Duration>) -> Self {
        Self {
            inner: RwLock::new(value),
            timeout,
        }
    }

    /// Acquire shared access
    pub fn shared(&self) -> Result<RwLockReadGuard<'_, T>> {
        match self.timeout {
            None => Ok(self.inner.read()),
            Some(timeout) => self.inner.try_read_for(timeout).ok_or(Error::LockTimeout),
        }
    }

    /// Acquire exclusive access
    pub fn exclusive(&self) -> Result<ExclusiveGuard<'_, T>> {
        let guard = match self.timeout {
            None => self.inner.write(),
            Some(timeout) => self
                .inner
                .try_write_for(timeout)
                .ok_or(Error::LockTimeout)?,
        };
        Ok(ExclusiveGuard {
            guard,
            timeout: self.timeout,
        })
    }

    /// Acquire shared access that can later be upgraded in place
    pub fn upgradable(&self) -> Result<UpgradableGuard<'_, T>> {
        let guard = match self.timeout {
            None => self.inner.upgradable_read(),
            Some(timeout) => self
                .inner
                .try_upgradable_read_for(timeout)
                .ok_or(Error::LockTimeout)?,
        };
        Ok(UpgradableGuard {
            guard,
            timeout: self.timeout,
        })
    }
}

/// Shared access that can be converted to exclusive without releasing.
pub struct UpgradableGuard<'a, T> {
    guard: RwLockUpgradableReadGuard<'a, T>,
    timeout: Option<Duration>,
}

impl<'a, T> UpgradableGuard<'a, T> {
    /// Wait for the other shared holders to leave and take exclusive access
    pub fn upgrade(self) -> Result<ExclusiveGuard<'a, T>> {
        let guard = match self.timeout {
            None => RwLockUpgradableReadGuard::upgrade(self.guard),
            Some(timeout) => RwLockUpgradableReadGuard::try_upgrade_for(self.guard, timeout)
                .map_err(|_| Error::LockTimeout)?,
        };
        Ok(ExclusiveGuard {
            guard,
            timeout: self.timeout,
        })
    }
}

impl<T> Deref for UpgradableGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive access; can step back down to upgradable.
pub struct ExclusiveGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    timeout: Option<Duration>,
}

impl<'a, T> ExclusiveGuard<'a, T> {
    /// Give up exclusive access while keeping shared access
    pub fn downgrade(self) -> UpgradableGuard<'a, T> {
        UpgradableGuard {
            guard: RwLockWriteGuard::downgrade_to_upgradable(self.guard),
            timeout: self.timeout,
        }
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
