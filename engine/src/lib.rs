// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Render pipelines riding on the runtime: the scene graph and its
//! compiler, tessellation, and the bucket and photon executors.

#![deny(unused_crate_dependencies)]
#![deny(unused_extern_crates)]

pub mod bucket;
pub mod buffer;
pub mod connection;
pub mod output;
pub mod photon;
pub mod qmc;
pub mod render;
pub mod sampler;
pub mod scene;
pub mod shaders;
pub mod tessellate;
pub mod trace;
pub mod types;

use std::sync::{Arc, OnceLock};

use helios_runtime::db::Database;
use helios_runtime::nodesys::shader::ShaderRegistry;
use helios_runtime::nodesys::NodeSys;

/// Ambient engine environment: the node system and the shader registry.
/// Job executors are plain functions dispatched by type code, so this
/// is the one piece of state they reach without a handle; each host
/// process installs it once at startup.
pub struct EngineEnv {
    pub nodes: NodeSys,
    pub shaders: ShaderRegistry,
}

static ENGINE: OnceLock<Arc<EngineEnv>> = OnceLock::new();

/// Installs the environment; later calls keep the first one.
pub fn init_env() -> Arc<EngineEnv> {
    ENGINE
        .get_or_init(|| {
            let env = EngineEnv {
                nodes: NodeSys::new(),
                shaders: ShaderRegistry::new(),
            };
            shaders::register_builtin(&env.shaders);
            Arc::new(env)
        })
        .clone()
}

pub fn env() -> Arc<EngineEnv> {
    init_env()
}

/// Registers every engine record and job type on a database. Both the
/// manager and the servers run this before any traffic.
pub fn register_types(db: &Database) {
    helios_runtime::db::builtin::register(db);
    NodeSys::register_types(db);
    types::register(db);
    tessellate::register(db);
    bucket::register(db);
    photon::register(db);
    buffer::register(db);
}
