// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! The shader execution seam. To the runtime a shader is a named object
//! with a `main` entry point over the shading state; implementations
//! come from built-in registration or from linked plugin modules.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use helios_data::shade::{ShadeResult, ShadeState};

use crate::db::Database;
use crate::error::Result;
use crate::nodesys::ParamView;
use crate::tls::Tls;

/// Execution context handed to a shader call.
pub struct ShaderCtx<'a> {
    pub db: &'a Database,
    pub params: &'a ParamView<'a>,
    pub tls: Tls,
}

pub trait Shader: Send + Sync {
    fn main(
        &self,
        ctx: &ShaderCtx<'_>,
        state: &mut ShadeState,
        result: &mut ShadeResult,
    ) -> Result<()>;
}

/// Name-keyed shader lookup shared by all workers.
#[derive(Default)]
pub struct ShaderRegistry {
    shaders: RwLock<HashMap<String, Arc<dyn Shader>>>,
}

impl ShaderRegistry {
    pub fn new() -> ShaderRegistry {
        Self::default()
    }

    pub fn register(&self, name: &str, shader: Arc<dyn Shader>) {
        self.shaders.write().unwrap().insert(name.to_owned(), shader);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Shader>> {
        self.shaders.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.shaders.read().unwrap().keys().cloned().collect()
    }
}
