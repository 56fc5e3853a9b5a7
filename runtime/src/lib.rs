// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! The distributed rendering runtime: tagged object database with
//! deferred generation, container primitives, job scheduler with local
//! and remote workers, and the manager/server transport.

#![deny(unused_crate_dependencies)]
#![deny(unused_extern_crates)]

pub mod collections;
pub mod config;
pub mod db;
pub mod error;
pub mod nodesys;
pub mod plugin;
pub mod scheduler;
pub mod tls;
pub mod transport;

pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use scheduler::{Process, Scheduler};
pub use tls::Tls;
