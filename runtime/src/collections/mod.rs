// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! In-memory container primitives underneath the database and the
//! render pipelines.

pub mod avl;
pub mod block_table;
pub mod datamap;
pub mod intern;
pub mod list;
pub mod pool;
pub mod rwlock;

use std::sync::atomic::{fence, Ordering};

/// Orders prior loads before subsequent loads.
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Orders prior stores before subsequent stores.
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Full two-way ordering.
pub fn full_barrier() {
    fence(Ordering::SeqCst);
}
