// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Dynamic plugin modules. A module is a shared library found on the
//! configured search paths; a plugin is a named factory the module
//! exports. Plugin objects carry their own destructor, invoked when the
//! handle closes; a module unloads once its last plugin is gone.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use libloading::Library;
use tracing::info;

use crate::error::{Error, Result};

/// Object returned by a plugin factory. The module allocates it and
/// frees it through `deletethis`.
#[repr(C)]
pub struct PluginObject {
    pub data: *mut c_void,
    pub deletethis: Option<unsafe extern "C" fn(*mut PluginObject)>,
}

type CreateFn = unsafe extern "C" fn() -> *mut PluginObject;

struct ModuleEntry {
    lib: Arc<Library>,
    /// Live plugin objects created from this module.
    refs: usize,
    /// Explicitly linked modules stay loaded at zero refs.
    pinned: bool,
}

#[derive(Default)]
struct Modules {
    map: HashMap<String, ModuleEntry>,
}

pub struct PluginSystem {
    search_paths: Vec<PathBuf>,
    modules: Mutex<Modules>,
}

impl PluginSystem {
    pub fn new(search_paths: Vec<PathBuf>) -> Arc<PluginSystem> {
        Arc::new(PluginSystem {
            search_paths,
            modules: Mutex::new(Modules::default()),
        })
    }

    /// Candidate file names for a module, against every search path.
    fn candidates(&self, module: &str) -> Vec<PathBuf> {
        let file_names = [
            format!("{}{}{}", std::env::consts::DLL_PREFIX, module, std::env::consts::DLL_SUFFIX),
            format!("{}{}", module, std::env::consts::DLL_SUFFIX),
        ];
        let mut out = vec![];
        for dir in &self.search_paths {
            for f in &file_names {
                out.push(dir.join(f));
            }
        }
        // Fall back to the loader's own search.
        out.push(PathBuf::from(&file_names[0]));
        out
    }

    /// Loads a module by name and pins it until `unlink`.
    pub fn link(&self, module: &str) -> Result<()> {
        let mut modules = self.modules.lock().unwrap();
        if let Some(entry) = modules.map.get_mut(module) {
            entry.pinned = true;
            return Ok(());
        }

        let lib = self.open_module(module)?;
        info!(module, "linked plugin module");
        modules.map.insert(
            module.to_owned(),
            ModuleEntry {
                lib: Arc::new(lib),
                refs: 0,
                pinned: true,
            },
        );
        Ok(())
    }

    fn open_module(&self, module: &str) -> Result<Library> {
        for path in self.candidates(module) {
            if let Ok(lib) = unsafe { Library::new(&path) } {
                return Ok(lib);
            }
        }
        Err(Error::PluginLoadFailed(module.to_owned()))
    }

    /// Unpins a module; it unloads once no plugin objects remain.
    pub fn unlink(&self, module: &str) -> Result<()> {
        let mut modules = self.modules.lock().unwrap();
        match modules.map.get_mut(module) {
            Some(entry) => {
                entry.pinned = false;
                if entry.refs == 0 {
                    modules.map.remove(module);
                    info!(module, "unloaded plugin module");
                }
                Ok(())
            }
            None => Err(Error::PluginLoadFailed(module.to_owned())),
        }
    }

    pub fn is_linked(&self, module: &str) -> bool {
        self.modules.lock().unwrap().map.contains_key(module)
    }

    /// Splits a dispatcher name into optional module and plugin parts.
    fn split_name(name: &str) -> (Option<&str>, &str) {
        match name.split_once('.') {
            Some((module, plugin)) => (Some(module), plugin),
            None => (None, name),
        }
    }

    /// Instantiates a plugin named either `module.plugin` or `plugin`;
    /// the bare form searches every loaded module.
    pub fn create(self: &Arc<Self>, name: &str) -> Result<PluginHandle> {
        let (module, plugin) = Self::split_name(name);
        let symbol = format!("create_{plugin}");

        let mut modules = self.modules.lock().unwrap();
        let found = match module {
            Some(m) => {
                let entry = modules
                    .map
                    .get(m)
                    .ok_or_else(|| Error::PluginLoadFailed(m.to_owned()))?;
                Self::resolve(entry, &symbol).map(|f| (m.to_owned(), f))
            }
            None => modules.map.iter().find_map(|(m, entry)| {
                Self::resolve(entry, &symbol).map(|f| (m.clone(), f))
            }),
        };

        let (module_name, create) =
            found.ok_or_else(|| Error::SymbolNotFound(symbol.clone()))?;

        let object = unsafe { create() };
        if object.is_null() {
            return Err(Error::PluginLoadFailed(name.to_owned()));
        }

        let entry = modules.map.get_mut(&module_name).unwrap();
        entry.refs += 1;
        Ok(PluginHandle {
            object,
            module: module_name,
            lib: entry.lib.clone(),
            system: self.clone(),
        })
    }

    fn resolve(entry: &ModuleEntry, symbol: &str) -> Option<CreateFn> {
        unsafe {
            entry
                .lib
                .get::<CreateFn>(symbol.as_bytes())
                .ok()
                .map(|s| *s)
        }
    }

    fn release(&self, module: &str) {
        let mut modules = self.modules.lock().unwrap();
        if let Some(entry) = modules.map.get_mut(module) {
            entry.refs -= 1;
            if entry.refs == 0 && !entry.pinned {
                modules.map.remove(module);
                info!(module, "unloaded plugin module");
            }
        }
    }
}

/// A live plugin object. Dropping it runs the object's own destructor
/// and lets the owning module unload.
pub struct PluginHandle {
    object: *mut PluginObject,
    module: String,
    /// Keeps the code mapped while the object is alive.
    #[allow(dead_code)]
    lib: Arc<Library>,
    system: Arc<PluginSystem>,
}

unsafe impl Send for PluginHandle {}

impl PluginHandle {
    pub fn data(&self) -> *mut c_void {
        unsafe { (*self.object).data }
    }

    pub fn module(&self) -> &str {
        &self.module
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        unsafe {
            if let Some(deletethis) = (*self.object).deletethis {
                deletethis(self.object);
            }
        }
        self.system.release(&self.module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(PluginSystem::split_name("exr.writer"), (Some("exr"), "writer"));
        assert_eq!(PluginSystem::split_name("writer"), (None, "writer"));
    }

    #[test]
    fn test_missing_module_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sys = PluginSystem::new(vec![dir.path().to_path_buf()]);
        assert!(matches!(
            sys.link("no_such_module"),
            Err(Error::PluginLoadFailed(_))
        ));
        assert!(!sys.is_linked("no_such_module"));
    }

    #[test]
    fn test_create_without_any_module() {
        let sys = PluginSystem::new(vec![]);
        assert!(matches!(
            sys.create("tone_map"),
            Err(Error::SymbolNotFound(_))
        ));
        assert!(matches!(
            sys.create("missing.tone_map"),
            Err(Error::PluginLoadFailed(_))
        ));
    }

    #[test]
    fn test_unlink_unknown() {
        let sys = PluginSystem::new(vec![]);
        assert!(sys.unlink("ghost").is_err());
    }
}
