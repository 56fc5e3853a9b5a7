// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Typed attribute graph over the database. A descriptor enumerates
//! parameters with storage class, type and default; a node is a record
//! carrying one value per parameter, looked up by interned name. Shader
//! nodes additionally carry a lazily generated flat parameter table
//! that execution reads from.

pub mod shader;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use helios_data::geom::{Color, Vec3};
use helios_data::shade::{ShadeResult, ShadeState};
use helios_data::{swap, Tag, TypeCode, NULL_TAG};

use crate::collections::intern::{Interner, Symbol};
use crate::db::{builtin, DataRef, Database, DbValue, TypeOps, DB_DEFER_INIT};
use crate::error::{Error, Result};
use crate::tls::Tls;

use shader::ShaderRegistry;

/// Storage class of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StorageClass {
    /// One value per node.
    Constant = 0,
    /// One value per primitive; the node holds a data array tag.
    Varying = 1,
    /// One value per vertex; the node holds a data array tag.
    Vertex = 2,
}

impl From<u32> for StorageClass {
    fn from(v: u32) -> Self {
        match v {
            1 => StorageClass::Varying,
            2 => StorageClass::Vertex,
            _ => StorageClass::Constant,
        }
    }
}

/// A parameter value in transit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Scalar(f32),
    Vector(Vec3),
    Color(Color),
    Tag(Tag),
}

impl ParamValue {
    pub fn type_code(&self) -> TypeCode {
        match self {
            ParamValue::Int(_) => builtin::TYPE_INT,
            ParamValue::Scalar(_) => builtin::TYPE_SCALAR,
            ParamValue::Vector(_) => builtin::TYPE_VECTOR,
            ParamValue::Color(_) => TYPE_COLOR,
            ParamValue::Tag(_) => builtin::TYPE_TAG,
        }
    }

    fn store(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        match self {
            ParamValue::Int(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            ParamValue::Scalar(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            ParamValue::Tag(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            ParamValue::Vector(v) => {
                out[..4].copy_from_slice(&v.x.to_ne_bytes());
                out[4..8].copy_from_slice(&v.y.to_ne_bytes());
                out[8..12].copy_from_slice(&v.z.to_ne_bytes());
            }
            ParamValue::Color(c) => {
                out[..4].copy_from_slice(&c.r.to_ne_bytes());
                out[4..8].copy_from_slice(&c.g.to_ne_bytes());
                out[8..12].copy_from_slice(&c.b.to_ne_bytes());
            }
        }
        out
    }

    fn load(type_code: TypeCode, bytes: &[u8; 16]) -> ParamValue {
        let f = |i: usize| f32::from_ne_bytes(bytes[i..i + 4].try_into().unwrap());
        match type_code {
            builtin::TYPE_INT => {
                ParamValue::Int(i32::from_ne_bytes(bytes[..4].try_into().unwrap()))
            }
            builtin::TYPE_SCALAR => ParamValue::Scalar(f(0)),
            builtin::TYPE_VECTOR => ParamValue::Vector(Vec3::new(f(0), f(4), f(8))),
            TYPE_COLOR => ParamValue::Color(Color::new(f(0), f(4), f(8))),
            _ => ParamValue::Tag(u32::from_ne_bytes(bytes[..4].try_into().unwrap())),
        }
    }

    pub fn as_tag(&self) -> Option<Tag> {
        match self {
            ParamValue::Tag(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            ParamValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<Color> {
        match self {
            ParamValue::Color(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<Vec3> {
        match self {
            ParamValue::Vector(v) => Some(*v),
            _ => None,
        }
    }
}

/// Color parameter storage type.
pub const TYPE_COLOR: TypeCode = 11;

pub const NAME_LEN: usize = 32;

fn name_bytes(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let n = name.len().min(NAME_LEN - 1);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

fn name_str(bytes: &[u8; NAME_LEN]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

// ---- record layouts -------------------------------------------------

#[derive(Clone, Copy)]
#[repr(C)]
struct DescHead {
    param_count: i32,
    _pad: [u32; 3],
}
unsafe impl DbValue for DescHead {}

#[derive(Clone, Copy)]
#[repr(C)]
struct DescSlot {
    storage: u32,
    type_code: TypeCode,
    default: [u8; 16],
    name: [u8; NAME_LEN],
}
unsafe impl DbValue for DescSlot {}

#[derive(Clone, Copy)]
#[repr(C)]
struct NodeHead {
    desc: Tag,
    param_count: i32,
    param_table: Tag,
    _pad: u32,
    shader: [u8; NAME_LEN],
}
unsafe impl DbValue for NodeHead {}

#[derive(Clone, Copy)]
#[repr(C)]
struct NodeSlot {
    type_code: TypeCode,
    storage: u32,
    value: [u8; 16],
}
unsafe impl DbValue for NodeSlot {}

#[derive(Clone, Copy)]
#[repr(C)]
struct TableHead {
    node: Tag,
    count: i32,
    _pad: [u32; 2],
}
unsafe impl DbValue for TableHead {}

#[derive(Clone, Copy)]
#[repr(C)]
struct TableEntry {
    name: [u8; NAME_LEN],
    type_code: TypeCode,
    storage: u32,
    value: [u8; 16],
}
unsafe impl DbValue for TableEntry {}

const DESC_HEAD: usize = std::mem::size_of::<DescHead>();
const DESC_SLOT: usize = std::mem::size_of::<DescSlot>();
const NODE_HEAD: usize = std::mem::size_of::<NodeHead>();
const NODE_SLOT: usize = std::mem::size_of::<NodeSlot>();
const TABLE_HEAD: usize = std::mem::size_of::<TableHead>();
const TABLE_ENTRY: usize = std::mem::size_of::<TableEntry>();

// ---- descriptors ----------------------------------------------------

/// Declares the parameters of a node type.
pub struct DescBuilder {
    name: String,
    params: Vec<(StorageClass, String, ParamValue)>,
}

impl DescBuilder {
    pub fn new(name: &str) -> DescBuilder {
        DescBuilder {
            name: name.to_owned(),
            params: vec![],
        }
    }

    pub fn param(mut self, storage: StorageClass, name: &str, default: ParamValue) -> Self {
        self.params.push((storage, name.to_owned(), default));
        self
    }
}

struct DescCache {
    /// Parameter symbols sorted for binary search, with slot indices.
    lookup: Vec<(Symbol, u32)>,
}

/// The node system context: interner plus per-descriptor lookup
/// caches, keyed by database identity so one context may serve several
/// stores.
pub struct NodeSys {
    interner: Interner,
    cache: Mutex<HashMap<(u64, Tag), Arc<DescCache>>>,
}

impl Default for NodeSys {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeSys {
    pub fn new() -> NodeSys {
        NodeSys {
            interner: Interner::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Installs the node record types; call once per database.
    pub fn register_types(db: &Database) {
        db.register_type(builtin::TYPE_NODE_DESC, TypeOps {
            name: "node_desc",
            atomic_size: 0,
            byteswap: Some(byteswap_desc),
            generate: None,
            execute: None,
        });
        db.register_type(builtin::TYPE_NODE, TypeOps {
            name: "node",
            atomic_size: 0,
            byteswap: Some(byteswap_node),
            generate: None,
            execute: None,
        });
        db.register_type(builtin::TYPE_PARAM_TABLE, TypeOps {
            name: "param_table",
            atomic_size: 0,
            byteswap: Some(byteswap_table),
            generate: Some(generate_param_table),
            execute: None,
        });
        db.register_type(TYPE_COLOR, TypeOps::atomic("color", 12, Some(swap_color)));
    }

    /// Stores a descriptor record and returns its tag.
    pub fn register_descriptor(&self, db: &Database, builder: DescBuilder) -> Result<Tag> {
        let size = DESC_HEAD + builder.params.len() * DESC_SLOT;
        let (tag, lease) = db.create(builtin::TYPE_NODE_DESC, size, 0)?;
        lease.get_mut::<DescHead>().param_count = builder.params.len() as i32;

        for (i, (storage, pname, default)) in builder.params.iter().enumerate() {
            *lease.get_at_mut::<DescSlot>(DESC_HEAD + i * DESC_SLOT) = DescSlot {
                storage: *storage as u32,
                type_code: default.type_code(),
                default: default.store(),
                name: name_bytes(pname),
            };
            if *storage != StorageClass::Constant && default.as_tag().is_none() {
                return Err(Error::TypeMismatch {
                    expected: builtin::TYPE_TAG,
                    found: default.type_code(),
                });
            }
        }
        drop(lease);

        tracing::debug!(desc = %builder.name, tag, "descriptor registered");
        Ok(tag)
    }

    fn desc_cache(&self, db: &Database, desc: Tag) -> Result<Arc<DescCache>> {
        let key = (db.id(), desc);
        if let Some(c) = self.cache.lock().unwrap().get(&key) {
            return Ok(c.clone());
        }

        let lease = db.access(desc)?;
        let count = lease.get::<DescHead>().param_count as usize;
        let mut lookup: Vec<(Symbol, u32)> = (0..count)
            .map(|i| {
                let slot = lease.get_at::<DescSlot>(DESC_HEAD + i * DESC_SLOT);
                (self.interner.intern(name_str(&slot.name)), i as u32)
            })
            .collect();
        lookup.sort_by_key(|(sym, _)| *sym);
        drop(lease);

        let cache = Arc::new(DescCache { lookup });
        self.cache.lock().unwrap().insert(key, cache.clone());
        Ok(cache)
    }

    /// Instantiates a node carrying the descriptor's defaults.
    pub fn create_node(&self, db: &Database, desc: Tag) -> Result<Tag> {
        self.create_node_impl(db, desc, "")
    }

    /// Instantiates a shader node bound to a registered shader name.
    pub fn create_shader_node(&self, db: &Database, desc: Tag, shader: &str) -> Result<Tag> {
        self.create_node_impl(db, desc, shader)
    }

    fn create_node_impl(&self, db: &Database, desc: Tag, shader: &str) -> Result<Tag> {
        let (count, slots) = {
            let lease = db.access(desc)?;
            let count = lease.get::<DescHead>().param_count as usize;
            let slots: Vec<DescSlot> = (0..count)
                .map(|i| *lease.get_at::<DescSlot>(DESC_HEAD + i * DESC_SLOT))
                .collect();
            (count, slots)
        };

        let size = NODE_HEAD + count * NODE_SLOT;
        let (tag, lease) = db.create(builtin::TYPE_NODE, size, 0)?;
        *lease.get_mut::<NodeHead>() = NodeHead {
            desc,
            param_count: count as i32,
            param_table: NULL_TAG,
            _pad: 0,
            shader: name_bytes(shader),
        };
        for (i, d) in slots.iter().enumerate() {
            *lease.get_at_mut::<NodeSlot>(NODE_HEAD + i * NODE_SLOT) = NodeSlot {
                type_code: d.type_code,
                storage: d.storage,
                value: d.default,
            };
        }
        drop(lease);

        if !shader.is_empty() {
            // Parameter table resolves lazily on first shader call.
            let (table, lease) = db.create(
                builtin::TYPE_PARAM_TABLE,
                TABLE_HEAD,
                DB_DEFER_INIT,
            )?;
            lease.get_mut::<TableHead>().node = tag;
            drop(lease);

            let lease = db.access(tag)?;
            lease.get_mut::<NodeHead>().param_table = table;
        }
        Ok(tag)
    }

    /// Descriptor tag of a node.
    pub fn desc_of(&self, db: &Database, node: Tag) -> Result<Tag> {
        let lease = db.access(node)?;
        Ok(lease.get::<NodeHead>().desc)
    }

    fn param_index(&self, db: &Database, node: Tag, name: &str) -> Result<u32> {
        let desc = {
            let lease = db.access(node)?;
            lease.get::<NodeHead>().desc
        };
        let cache = self.desc_cache(db, desc)?;
        let sym = self.interner.intern(name);
        cache
            .lookup
            .binary_search_by_key(&sym, |(s, _)| *s)
            .map(|i| cache.lookup[i].1)
            .map_err(|_| Error::SymbolNotFound(name.to_owned()))
    }

    /// Writes a parameter by name. The value's type must match the
    /// descriptor.
    pub fn set_param(&self, db: &Database, node: Tag, name: &str, value: ParamValue) -> Result<()> {
        let index = self.param_index(db, node, name)? as usize;
        let lease = db.access(node)?;
        let slot = lease.get_at_mut::<NodeSlot>(NODE_HEAD + index * NODE_SLOT);

        let expected = if StorageClass::from(slot.storage) == StorageClass::Constant {
            slot.type_code
        } else {
            builtin::TYPE_TAG
        };
        if value.type_code() != expected {
            return Err(Error::TypeMismatch {
                expected,
                found: value.type_code(),
            });
        }

        slot.value = value.store();
        lease.dirt();
        Ok(())
    }

    /// Reads a parameter by name.
    pub fn get_param(&self, db: &Database, node: Tag, name: &str) -> Result<ParamValue> {
        let index = self.param_index(db, node, name)? as usize;
        let lease = db.access(node)?;
        let slot = lease.get_at::<NodeSlot>(NODE_HEAD + index * NODE_SLOT);
        let code = if StorageClass::from(slot.storage) == StorageClass::Constant {
            slot.type_code
        } else {
            builtin::TYPE_TAG
        };
        Ok(ParamValue::load(code, &slot.value))
    }

    /// The lazily built flat parameter table of a shader node.
    pub fn param_table(&self, db: &Database, node: Tag) -> Result<Tag> {
        let lease = db.access(node)?;
        let table = lease.get::<NodeHead>().param_table;
        if table == NULL_TAG {
            return Err(Error::SymbolNotFound("param_table".into()));
        }
        Ok(table)
    }

    /// Executes a single shader instance over the state.
    pub fn call_shader_instance(
        &self,
        db: &Database,
        shaders: &ShaderRegistry,
        state: &mut ShadeState,
        result: &mut ShadeResult,
        node: Tag,
    ) -> Result<()> {
        let (shader_name, table) = {
            let lease = db.access(node)?;
            let head = lease.get::<NodeHead>();
            (name_str(&head.shader).to_owned(), head.param_table)
        };
        let shader = shaders
            .find(&shader_name)
            .ok_or_else(|| Error::SymbolNotFound(shader_name.clone()))?;

        let params = ParamView::open(db, table)?;
        shader.main(
            &shader::ShaderCtx {
                db,
                params: &params,
                tls: Tls,
            },
            state,
            result,
        )
    }

    /// Executes a shader list in order, returning the accumulated color
    /// and opacity.
    pub fn call_shader_list(
        &self,
        db: &Database,
        shaders: &ShaderRegistry,
        state: &mut ShadeState,
        list: Tag,
    ) -> Result<ShadeResult> {
        let mut result = ShadeResult::default();
        let count = crate::db::array::size(db, list)?;
        for i in 0..count {
            let node: Tag = crate::db::array::get(db, list, i)?;
            self.call_shader_instance(db, shaders, state, &mut result, node)?;
        }
        Ok(result)
    }
}

// ---- flat parameter tables ------------------------------------------

/// Read view over a shader node's flattened parameter table.
pub struct ParamView<'db> {
    lease: DataRef<'db>,
    count: usize,
}

impl<'db> ParamView<'db> {
    fn open(db: &'db Database, table: Tag) -> Result<ParamView<'db>> {
        let lease = db.access(table)?;
        let count = lease.get::<TableHead>().count as usize;
        Ok(ParamView { lease, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Binary search over the name-sorted entries.
    pub fn get(&self, name: &str) -> Option<ParamValue> {
        let wanted = name_bytes(name);
        let mut lo = 0usize;
        let mut hi = self.count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let entry = self.lease.get_at::<TableEntry>(TABLE_HEAD + mid * TABLE_ENTRY);
            match entry.name.cmp(&wanted) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    let code = if StorageClass::from(entry.storage) == StorageClass::Constant {
                        entry.type_code
                    } else {
                        builtin::TYPE_TAG
                    };
                    return Some(ParamValue::load(code, &entry.value));
                }
            }
        }
        None
    }

    pub fn scalar(&self, name: &str, fallback: f32) -> f32 {
        self.get(name).and_then(|v| v.as_scalar()).unwrap_or(fallback)
    }

    pub fn color(&self, name: &str, fallback: Color) -> Color {
        self.get(name).and_then(|v| v.as_color()).unwrap_or(fallback)
    }
}

/// Generator resolving a shader node's parameters into a flat table
/// sorted by name. Runs on the first access of the table record.
fn generate_param_table(db: &Database, tag: Tag, _tls: Tls) -> Result<()> {
    let node = {
        let lease = db.access(tag)?;
        lease.get::<TableHead>().node
    };

    let lease = db.access(node)?;
    let head = *lease.get::<NodeHead>();
    let slots: Vec<NodeSlot> = (0..head.param_count as usize)
        .map(|i| *lease.get_at::<NodeSlot>(NODE_HEAD + i * NODE_SLOT))
        .collect();
    drop(lease);

    let desc_lease = db.access(head.desc)?;
    let mut entries: Vec<TableEntry> = slots
        .iter()
        .enumerate()
        .map(|(i, slot)| {
            let d = desc_lease.get_at::<DescSlot>(DESC_HEAD + i * DESC_SLOT);
            TableEntry {
                name: d.name,
                type_code: slot.type_code,
                storage: slot.storage,
                value: slot.value,
            }
        })
        .collect();
    drop(desc_lease);
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let lease = db.access(tag)?;
    let lease = lease.resize(TABLE_HEAD + entries.len() * TABLE_ENTRY)?;
    {
        let h = lease.get_mut::<TableHead>();
        h.node = node;
        h.count = entries.len() as i32;
    }
    for (i, e) in entries.iter().enumerate() {
        *lease.get_at_mut::<TableEntry>(TABLE_HEAD + i * TABLE_ENTRY) = *e;
    }
    Ok(())
}

// ---- byte-swap ------------------------------------------------------

fn swap_color(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, 3);
}

fn swap_value(type_code: TypeCode, bytes: &mut [u8]) {
    match type_code {
        builtin::TYPE_VECTOR | TYPE_COLOR => swap::swap_fields(bytes, 4, 3),
        _ => swap::swap32(&mut bytes[..4]),
    }
}

fn byteswap_desc(_db: &Database, bytes: &mut [u8]) {
    let arriving = u32::from_ne_bytes(bytes[0..4].try_into().unwrap()) > 0xFFFF;
    if arriving {
        swap::swap32(&mut bytes[0..4]);
    }
    let count = i32::from_ne_bytes(bytes[0..4].try_into().unwrap()) as usize;
    for i in 0..count {
        let base = DESC_HEAD + i * DESC_SLOT;
        if arriving {
            swap::swap32(&mut bytes[base..base + 4]);
            swap::swap32(&mut bytes[base + 4..base + 8]);
        }
        let type_code = u32::from_ne_bytes(bytes[base + 4..base + 8].try_into().unwrap());
        swap_value(type_code, &mut bytes[base + 8..base + 24]);
        if !arriving {
            swap::swap32(&mut bytes[base..base + 4]);
            swap::swap32(&mut bytes[base + 4..base + 8]);
        }
    }
    if !arriving {
        swap::swap32(&mut bytes[0..4]);
    }
}

fn byteswap_node(_db: &Database, bytes: &mut [u8]) {
    let arriving = u32::from_ne_bytes(bytes[4..8].try_into().unwrap()) > 0xFFFF;
    let swap_head = |bytes: &mut [u8]| {
        swap::swap32(&mut bytes[0..4]);
        swap::swap32(&mut bytes[4..8]);
        swap::swap32(&mut bytes[8..12]);
    };
    if arriving {
        swap_head(bytes);
    }
    let count = i32::from_ne_bytes(bytes[4..8].try_into().unwrap()) as usize;
    for i in 0..count {
        let base = NODE_HEAD + i * NODE_SLOT;
        if arriving {
            swap::swap32(&mut bytes[base..base + 4]);
            swap::swap32(&mut bytes[base + 4..base + 8]);
        }
        let type_code = u32::from_ne_bytes(bytes[base..base + 4].try_into().unwrap());
        swap_value(type_code, &mut bytes[base + 8..base + 24]);
        if !arriving {
            swap::swap32(&mut bytes[base..base + 4]);
            swap::swap32(&mut bytes[base + 4..base + 8]);
        }
    }
    if !arriving {
        swap_head(bytes);
    }
}

fn byteswap_table(_db: &Database, bytes: &mut [u8]) {
    let arriving = u32::from_ne_bytes(bytes[4..8].try_into().unwrap()) > 0xFFFF;
    let swap_head = |bytes: &mut [u8]| {
        swap::swap32(&mut bytes[0..4]);
        swap::swap32(&mut bytes[4..8]);
    };
    if arriving {
        swap_head(bytes);
    }
    let count = i32::from_ne_bytes(bytes[4..8].try_into().unwrap()) as usize;
    for i in 0..count {
        let base = TABLE_HEAD + i * TABLE_ENTRY + NAME_LEN;
        if arriving {
            swap::swap32(&mut bytes[base..base + 4]);
            swap::swap32(&mut bytes[base + 4..base + 8]);
        }
        let type_code = u32::from_ne_bytes(bytes[base..base + 4].try_into().unwrap());
        swap_value(type_code, &mut bytes[base + 8..base + 24]);
        if !arriving {
            swap::swap32(&mut bytes[base..base + 4]);
            swap::swap32(&mut bytes[base + 4..base + 8]);
        }
    }
    if !arriving {
        swap_head(bytes);
    }
}
