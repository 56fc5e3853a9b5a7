// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Writer-exclusive, reader-shared lock over a single atomic integer,
//! with try-write, upgrade and downgrade. Contended paths spin briefly
//! and then yield to the scheduler.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

const WRITER: u32 = 1 << 31;
const SPINS_BEFORE_YIELD: u32 = 64;

pub struct RwLock<T: ?Sized> {
    state: AtomicU32,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send + ?Sized> Send for RwLock<T> {}
unsafe impl<T: Send + Sync + ?Sized> Sync for RwLock<T> {}

fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        RwLock {
            state: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut spins = 0;
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ReadGuard { lock: self };
            }
            backoff(&mut spins);
        }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut spins = 0;
        loop {
            if let Some(guard) = self.try_write() {
                return guard;
            }
            backoff(&mut spins);
        }
    }

    /// Succeeds only when no reader or writer holds the lock.
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        if self
            .state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(WriteGuard { lock: self })
        } else {
            None
        }
    }

    fn unlock_read(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn unlock_write(&self) {
        self.state.store(0, Ordering::Release);
    }
}

pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<'a, T> ReadGuard<'a, T> {
    /// Waits until this is the last reader, then takes the writer bit.
    /// Only one reader may attempt the upgrade at a time.
    pub fn upgrade(self) -> WriteGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);

        let mut spins = 0;
        while lock
            .state
            .compare_exchange(1, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff(&mut spins);
        }
        WriteGuard { lock }
    }
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<'a, T> WriteGuard<'a, T> {
    /// Releases exclusivity while keeping a read hold, without letting
    /// another writer slip in between.
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        lock.state.store(1, Ordering::Release);
        ReadGuard { lock }
    }
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_exclusion() {
        let lock = RwLock::new(0u32);

        let r1 = lock.read();
        let r2 = lock.read();
        assert!(lock.try_write().is_none());
        drop(r1);
        assert!(lock.try_write().is_none());
        drop(r2);

        let w = lock.try_write().expect("free lock must be writable");
        assert!(lock.try_write().is_none());
        drop(w);
    }

    #[test]
    fn test_upgrade_downgrade() {
        let lock = RwLock::new(7u32);
        let r = lock.read();
        let mut w = r.upgrade();
        *w = 8;
        let r = w.downgrade();
        assert_eq!(*r, 8);
        assert!(lock.try_write().is_none());
        drop(r);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_concurrent_counter() {
        let lock = Arc::new(RwLock::new(0u64));
        let mut handles = vec![];
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.write() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 40_000);
    }
}
