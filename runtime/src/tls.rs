// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Per-thread state for workers: random stream, worker index, and typed
//! scratch caches. Executors and generators reach it through the `Tls`
//! handle; caches are taken out for the duration of a job and put back,
//! so nested database calls never contend with an open borrow.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use crate::scheduler::AbortFlag;

thread_local! {
    static RNG_STATE: Cell<u64> = const { Cell::new(0x853c_49e6_748f_ea9b) };
    static WORKER_INDEX: Cell<usize> = const { Cell::new(0) };
    static CACHES: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
    static ABORT: RefCell<Option<Arc<AbortFlag>>> = const { RefCell::new(None) };
}

/// Handle to the calling thread's worker state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tls;

impl Tls {
    /// Installs the identity and seeds the random stream of a worker
    /// thread. Streams of distinct workers never collide.
    pub fn init_worker(index: usize) {
        WORKER_INDEX.with(|w| w.set(index));
        RNG_STATE.with(|s| s.set(0x853c_49e6_748f_ea9b ^ ((index as u64 + 1) << 17)));
    }

    pub fn worker_index(&self) -> usize {
        WORKER_INDEX.with(|w| w.get())
    }

    /// Next value of the thread's xorshift stream.
    pub fn next_u64(&self) -> u64 {
        RNG_STATE.with(|s| {
            let mut x = s.get();
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            s.set(x);
            x
        })
    }

    /// Uniform sample in [0, 1).
    pub fn next_f32(&self) -> f32 {
        (self.next_u64() >> 40) as f32 * (1.0 / (1u64 << 24) as f32)
    }

    /// Removes the typed scratch cache from this thread, constructing a
    /// fresh one on first use. Pair with `put_cache` when done.
    pub fn take_cache<T: Any + Default>(&self) -> Box<T> {
        CACHES.with(|c| {
            c.borrow_mut()
                .remove(&TypeId::of::<T>())
                .and_then(|b| b.downcast::<T>().ok())
                .unwrap_or_default()
        })
    }

    pub fn put_cache<T: Any>(&self, cache: Box<T>) {
        CACHES.with(|c| {
            c.borrow_mut().insert(TypeId::of::<T>(), cache);
        });
    }

    /// Drops all scratch caches of this thread.
    pub fn clear_caches(&self) {
        CACHES.with(|c| c.borrow_mut().clear());
    }

    /// Binds the cancellation flag executors poll on this thread.
    pub fn install_abort(flag: Arc<AbortFlag>) {
        ABORT.with(|a| *a.borrow_mut() = Some(flag));
    }

    pub fn clear_abort() {
        ABORT.with(|a| *a.borrow_mut() = None);
    }

    /// Polls cooperative cancellation; cheap enough for inner loops.
    pub fn aborted(&self) -> bool {
        ABORT.with(|a| a.borrow().as_ref().map(|f| f.check()).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_advances() {
        let tls = Tls;
        let a = tls.next_u64();
        let b = tls.next_u64();
        assert_ne!(a, b);
        let f = tls.next_f32();
        assert!((0.0..1.0).contains(&f));
    }

    #[test]
    fn test_cache_round_trip() {
        let tls = Tls;
        tls.clear_caches();
        let mut buf = tls.take_cache::<Vec<u32>>();
        assert!(buf.is_empty());
        buf.push(7);
        tls.put_cache(buf);
        let buf = tls.take_cache::<Vec<u32>>();
        assert_eq!(*buf, vec![7]);
        tls.clear_caches();
    }

    #[test]
    fn test_worker_index() {
        Tls::init_worker(3);
        assert_eq!(Tls.worker_index(), 3);
        Tls::init_worker(0);
    }
}
