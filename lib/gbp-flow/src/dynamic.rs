// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A wrapper for values replaced wholesale at runtime (the policy
//! snapshot, the agent config), where readers take a cheap snapshot
//! tagged with the epoch it was read at.

use std::fmt::Debug;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Clone)]
pub struct Dynamic<T>(Arc<InnerDynamic<T>>);

struct InnerDynamic<T> {
    inner: RwLock<Arc<T>>,
    epoch: AtomicU64,
}

#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Arc<T>,
    pub epoch: u64,
}

impl<T> From<T> for Dynamic<T> {
    fn from(value: T) -> Self {
        Self(
            InnerDynamic {
                inner: RwLock::new(Arc::new(value)),
                epoch: AtomicU64::default(),
            }
            .into(),
        )
    }
}

impl<T> Dynamic<T> {
    pub fn store(&self, value: T) {
        let mut inner =
            self.0.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = value.into();
        _ = self.0.epoch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load(&self) -> Snapshot<T> {
        let value_locked =
            self.0.inner.read().unwrap_or_else(PoisonError::into_inner);
        let value = Arc::clone(&*value_locked);
        let epoch = self.0.epoch.load(Ordering::Relaxed);

        Snapshot { epoch, value }
    }
}

impl<T: Clone> Dynamic<T> {
    /// Store a copy of the current value after `f` has changed it.
    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        let mut inner =
            self.0.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut value = T::clone(&inner);
        f(&mut value);
        *inner = value.into();
        _ = self.0.epoch.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T: Debug> Debug for Dynamic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current_val = self.load();
        write!(f, "{current_val:?}")
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn epochs_advance() {
        let d = Dynamic::from(vec![1]);
        let s0 = d.load();
        d.store(vec![2]);
        d.update(|v| v.push(3));
        let s2 = d.load();
        assert_eq!(*s0, vec![1]);
        assert_eq!(*s2, vec![2, 3]);
        assert_eq!(s2.epoch, s0.epoch + 2);
    }
}
