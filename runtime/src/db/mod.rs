// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Tag-indexed record store. Every piece of render data lives here as a
//! typed byte payload addressed by tag; access pins the payload at a
//! stable address, deferred records run their type's generator on first
//! access, and flushable payloads are dropped under memory pressure in
//! LRU order and rebuilt on demand.

pub mod array;
mod payload;
pub mod table;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

use smallvec::SmallVec;
use tracing::{debug, warn};

use helios_data::{Endian, HostId, Tag, TypeCode, NULL_TAG};

use crate::collections::datamap::DataMap;
use crate::collections::list::{Link, LinkArena, List, NIL};
use crate::collections::pool::FixedPool;
use crate::collections::rwlock::RwLock;
use crate::error::{Error, Result};
use crate::tls::Tls;

pub use payload::{PayloadBuf, PAYLOAD_ALIGN};

use std::sync::Arc;

/// Payload may be dropped under memory pressure and rebuilt on the next
/// access.
pub const DB_FLUSHABLE: u32 = 1 << 0;
/// First access must run the type's generator instead of reading what
/// creation left behind.
pub const DB_DEFER_INIT: u32 = 1 << 1;

/// Produces the payload of a deferred record on first access.
pub type GenerateFn = fn(&Database, Tag, Tls) -> Result<()>;
/// Byte-swaps one payload in place, dispatched by type code.
pub type ByteswapFn = fn(&Database, &mut [u8]);
/// Runs a job record on a worker thread, returning its result code.
pub type ExecuteFn = fn(&Database, Tag, Tls) -> Result<i32>;

/// Per-type operation table. The type code is the only reflection the
/// runtime has; everything polymorphic dispatches through here.
#[derive(Clone, Copy)]
pub struct TypeOps {
    pub name: &'static str,
    /// Item size for atomic types, 0 for compound records.
    pub atomic_size: usize,
    pub byteswap: Option<ByteswapFn>,
    pub generate: Option<GenerateFn>,
    pub execute: Option<ExecuteFn>,
}

impl TypeOps {
    pub const fn opaque(name: &'static str) -> TypeOps {
        TypeOps {
            name,
            atomic_size: 0,
            byteswap: None,
            generate: None,
            execute: None,
        }
    }

    pub const fn atomic(name: &'static str, size: usize, byteswap: Option<ByteswapFn>) -> TypeOps {
        TypeOps {
            name,
            atomic_size: size,
            byteswap,
            generate: None,
            execute: None,
        }
    }
}

/// Values that may be viewed in place inside a record payload.
///
/// # Safety
///
/// Implementors must be plain bytes: `repr(C)`, no padding-sensitive
/// invariants, valid for any bit pattern, alignment at most
/// [`PAYLOAD_ALIGN`].
pub unsafe trait DbValue: Copy + 'static {}

unsafe impl DbValue for u8 {}
unsafe impl DbValue for u16 {}
unsafe impl DbValue for u32 {}
unsafe impl DbValue for i32 {}
unsafe impl DbValue for u64 {}
unsafe impl DbValue for i64 {}
unsafe impl DbValue for f32 {}
unsafe impl DbValue for f64 {}
unsafe impl DbValue for [f32; 4] {}
unsafe impl DbValue for helios_data::geom::Vec3 {}
unsafe impl DbValue for helios_data::geom::Color {}
unsafe impl DbValue for helios_data::geom::Mat4 {}
unsafe impl DbValue for helios_data::geom::Rect {}

/// Where the payload of a record currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadState {
    /// Bytes are resident and current.
    Ready,
    /// Bytes must be produced by the type's generator.
    Deferred,
    /// Bytes live on another host and are fetched on access.
    Remote,
    /// The generator failed; latched until the record is deleted.
    Failed,
}

struct Record {
    type_code: TypeCode,
    flags: u32,
    pins: u32,
    dirty: bool,
    state: PayloadState,
    payload: Option<PayloadBuf>,
    /// Hosts holding a copy of this record.
    holders: SmallVec<[HostId; 4]>,
    /// Host that owns the authoritative payload.
    owner: HostId,
    /// Slot on the eviction list, NIL while pinned or unlisted.
    lru_slot: u32,
}

struct RecordSlot {
    tag: Tag,
    inner: Mutex<Record>,
}

struct LruNode {
    link: Link,
    tag: Tag,
}

#[derive(Default)]
struct Lru {
    list: List,
    nodes: FixedPool<LruNode>,
}

impl Default for FixedPool<LruNode> {
    fn default() -> Self {
        FixedPool::new(256)
    }
}

impl LinkArena for FixedPool<LruNode> {
    fn link(&self, idx: u32) -> &Link {
        &self.get(idx).unwrap().link
    }
    fn link_mut(&mut self, idx: u32) -> &mut Link {
        &mut self.get_mut(idx).unwrap().link
    }
}

impl Lru {
    fn push(&mut self, tag: Tag) -> u32 {
        let slot = self.nodes.alloc(LruNode {
            link: Link::default(),
            tag,
        });
        let Lru { list, nodes } = self;
        list.push_back(nodes, slot);
        slot
    }

    fn remove(&mut self, slot: u32) {
        let Lru { list, nodes } = self;
        list.remove(nodes, slot);
        nodes.free(slot);
    }

    /// Front-to-back snapshot of eviction candidates.
    fn candidates(&self) -> Vec<Tag> {
        self.list
            .iter(&self.nodes)
            .map(|idx| self.nodes.get(idx).unwrap().tag)
            .collect()
    }
}

/// Link to the rest of the render farm, installed on hosts that take
/// part in a distributed session.
pub trait PeerLink: Send + Sync {
    /// Local host id.
    fn host(&self) -> HostId;
    /// Whether payloads arriving from the owner need a byte-swap.
    fn need_byteswap(&self) -> bool;
    /// Mints a fresh tag, possibly via a manager round-trip.
    fn allocate_tag(&self) -> Result<Tag>;
    /// Pulls the payload of a record from its owning host.
    fn fetch(&self, tag: Tag, owner: HostId) -> Result<Fetched>;
    /// Announces a locally created record.
    fn notify_created(&self, tag: Tag, type_code: TypeCode, size: u32, flags: u32) -> Result<()>;
    /// Announces a locally deleted record.
    fn notify_deleted(&self, tag: Tag) -> Result<()>;
    /// Announces that the local generator produced this record.
    fn notify_generated(&self, tag: Tag) -> Result<()>;
    /// Tells `holders` to drop their copy and re-fetch on next access.
    fn flush(&self, tag: Tag, holders: &[HostId]) -> Result<()>;
}

pub struct Fetched {
    pub bytes: Vec<u8>,
    pub inited: bool,
}

static NEXT_DB_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// The tagged object database.
pub struct Database {
    id: u64,
    records: RwLock<DataMap<Arc<RecordSlot>>>,
    types: std::sync::RwLock<Vec<Option<TypeOps>>>,
    next_tag: AtomicU32,
    mem_used: AtomicUsize,
    mem_limit: usize,
    lru: Mutex<Lru>,
    /// Tags whose generation or fetch is in flight, by running thread.
    inflight: Mutex<HashMap<Tag, ThreadId>>,
    inflight_cv: Condvar,
    peer: std::sync::RwLock<Option<Arc<dyn PeerLink>>>,
    endian: Endian,
}

impl Database {
    /// Opens an in-memory database bounded by `mem_limit` bytes of
    /// payload; 0 means unbounded.
    pub fn new(mem_limit: usize) -> Database {
        Database {
            id: NEXT_DB_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            records: RwLock::new(DataMap::new()),
            types: std::sync::RwLock::new(vec![]),
            next_tag: AtomicU32::new(0),
            mem_used: AtomicUsize::new(0),
            mem_limit: if mem_limit == 0 { usize::MAX } else { mem_limit },
            lru: Mutex::new(Lru::default()),
            inflight: Mutex::new(HashMap::new()),
            inflight_cv: Condvar::new(),
            peer: std::sync::RwLock::new(None),
            endian: Endian::native(),
        }
    }

    /// Process-unique identity of this database instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn host(&self) -> HostId {
        self.peer
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.host())
            .unwrap_or(helios_data::MANAGER_HOST)
    }

    pub fn set_peer(&self, peer: Arc<dyn PeerLink>) {
        *self.peer.write().unwrap() = Some(peer);
    }

    pub fn clear_peer(&self) {
        *self.peer.write().unwrap() = None;
    }

    fn peer(&self) -> Option<Arc<dyn PeerLink>> {
        self.peer.read().unwrap().clone()
    }

    /// Bytes of payload currently resident.
    pub fn memory_in_use(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- type registry ----------------------------------------------

    pub fn register_type(&self, code: TypeCode, ops: TypeOps) {
        let mut types = self.types.write().unwrap();
        if code as usize >= types.len() {
            types.resize(code as usize + 1, None);
        }
        types[code as usize] = Some(ops);
    }

    pub fn type_ops(&self, code: TypeCode) -> Option<TypeOps> {
        self.types.read().unwrap().get(code as usize).copied().flatten()
    }

    /// Registered item size for atomic types, 0 for compound types.
    pub fn type_size(&self, code: TypeCode) -> usize {
        self.type_ops(code).map(|t| t.atomic_size).unwrap_or(0)
    }

    /// Byte-swaps a payload of the given type in place.
    pub fn byteswap(&self, code: TypeCode, bytes: &mut [u8]) {
        if let Some(swap) = self.type_ops(code).and_then(|t| t.byteswap) {
            swap(self, bytes);
        }
    }

    // ---- tag allocation ---------------------------------------------

    pub fn allocate_tag(&self) -> Result<Tag> {
        if let Some(peer) = self.peer() {
            return peer.allocate_tag();
        }
        self.allocate_local_tag()
    }

    /// Mints a tag from the local counter. Only the manager owns the
    /// tag space; peers go through `allocate_tag`.
    pub fn allocate_local_tag(&self) -> Result<Tag> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        if tag == NULL_TAG {
            return Err(Error::OutOfTags);
        }
        Ok(tag)
    }

    // ---- record lifecycle -------------------------------------------

    /// Allocates a tag and zeroed storage, returning a write lease. The
    /// generator of a `DB_DEFER_INIT` record runs on the first access
    /// after this lease ends.
    pub fn create(&self, type_code: TypeCode, size: usize, flags: u32) -> Result<(Tag, DataRef<'_>)> {
        let tag = self.allocate_tag()?;
        self.install(tag, type_code, size, flags, self.host())?;

        if let Some(peer) = self.peer() {
            peer.notify_created(tag, type_code, size as u32, flags)?;
        }

        let lease = self.pin_raw(tag)?;
        Ok((tag, lease))
    }

    /// Installs a record at a tag minted elsewhere. Used for records
    /// announced by other hosts; their payload stays remote until
    /// accessed. Re-announcing a known tag is a no-op.
    pub fn create_at(
        &self,
        tag: Tag,
        type_code: TypeCode,
        size: usize,
        flags: u32,
        owner: HostId,
    ) -> Result<()> {
        if self.records.read().contains(tag) {
            return Ok(());
        }
        self.install(tag, type_code, size, flags, owner)
    }

    /// Header snapshot of every record, for announcing to a peer.
    pub fn headers(&self) -> Vec<(Tag, TypeCode, u32, u32)> {
        let records = self.records.read();
        let mut out = Vec::with_capacity(records.len());
        records.for_each(|tag, slot| {
            let rec = slot.inner.lock().unwrap();
            let size = rec.payload.as_ref().map(|p| p.size()).unwrap_or(0);
            out.push((tag, rec.type_code, size as u32, rec.flags));
        });
        out
    }

    /// Tags with locally changed payloads since the last call; their
    /// dirty bits are cleared.
    pub fn take_dirty(&self) -> Vec<Tag> {
        let records = self.records.read();
        let mut out = vec![];
        records.for_each(|tag, slot| {
            let mut rec = slot.inner.lock().unwrap();
            if rec.dirty {
                rec.dirty = false;
                out.push(tag);
            }
        });
        out
    }

    fn install(
        &self,
        tag: Tag,
        type_code: TypeCode,
        size: usize,
        flags: u32,
        owner: HostId,
    ) -> Result<()> {
        let local = owner == self.host();
        let state = if local {
            if flags & DB_DEFER_INIT != 0 {
                PayloadState::Deferred
            } else {
                PayloadState::Ready
            }
        } else if flags & DB_DEFER_INIT != 0 {
            // Deferred data is generated on every host that needs it.
            PayloadState::Deferred
        } else {
            PayloadState::Remote
        };

        let payload = if state == PayloadState::Remote {
            None
        } else {
            self.reserve_memory(size)?;
            Some(PayloadBuf::zeroed(size))
        };

        let slot = Arc::new(RecordSlot {
            tag,
            inner: Mutex::new(Record {
                type_code,
                flags,
                pins: 0,
                dirty: false,
                state,
                payload,
                holders: SmallVec::new(),
                owner,
                lru_slot: NIL,
            }),
        });

        let mut records = self.records.write();
        if records.contains(tag) {
            if let Some(p) = slot.inner.lock().unwrap().payload.take() {
                self.mem_used.fetch_sub(p.size(), Ordering::Relaxed);
            }
            return Err(Error::ProtocolViolation(format!(
                "tag {tag:#010x} created twice"
            )));
        }
        records.insert(tag, slot);
        Ok(())
    }

    /// Releases a record. Fails with `BusyRecord` while leases are
    /// outstanding.
    pub fn delete(&self, tag: Tag) -> Result<()> {
        let slot = {
            let records = self.records.read();
            records.get(tag).cloned().ok_or(Error::UnknownTag(tag))?
        };

        {
            let rec = slot.inner.lock().unwrap();
            if rec.pins > 0 {
                return Err(Error::BusyRecord(tag));
            }
        }

        self.records.write().remove(tag);

        let mut rec = slot.inner.lock().unwrap();
        if rec.lru_slot != NIL {
            self.lru.lock().unwrap().remove(rec.lru_slot);
            rec.lru_slot = NIL;
        }
        if let Some(payload) = rec.payload.take() {
            self.mem_used.fetch_sub(payload.size(), Ordering::Relaxed);
        }
        let notify = rec.owner == self.host();
        drop(rec);

        if notify {
            if let Some(peer) = self.peer() {
                peer.notify_deleted(tag)?;
            }
        }
        Ok(())
    }

    /// Pins the record and returns its payload. Runs the generator or
    /// fetches remote bytes first when needed.
    pub fn access(&self, tag: Tag) -> Result<DataRef<'_>> {
        let slot = self.slot(tag)?;

        loop {
            let mut rec = slot.inner.lock().unwrap();
            match rec.state {
                PayloadState::Ready => return Ok(self.pin_locked(&slot, &mut rec)),
                PayloadState::Failed => return Err(Error::GenerateFailed(tag)),
                PayloadState::Deferred | PayloadState::Remote => {
                    let me = std::thread::current().id();
                    {
                        let mut inflight = self.inflight.lock().unwrap();
                        match inflight.get(&tag).copied() {
                            // A generator may access its own record
                            // while filling it in.
                            Some(tid) if tid == me => {
                                return Ok(self.pin_locked(&slot, &mut rec));
                            }
                            Some(_) => {
                                drop(rec);
                                let _unused = self.inflight_cv.wait(inflight).unwrap();
                                continue;
                            }
                            None => {
                                inflight.insert(tag, me);
                            }
                        }
                    }

                    let pending = rec.state;
                    drop(rec);

                    let outcome = match pending {
                        PayloadState::Deferred => self.run_generator(&slot, tag),
                        _ => self.fetch_remote(&slot, tag),
                    };

                    {
                        let mut rec = slot.inner.lock().unwrap();
                        rec.state = match outcome {
                            Ok(()) => PayloadState::Ready,
                            Err(_) => PayloadState::Failed,
                        };
                    }
                    {
                        let mut inflight = self.inflight.lock().unwrap();
                        inflight.remove(&tag);
                    }
                    self.inflight_cv.notify_all();

                    if let Err(e) = outcome {
                        warn!(tag = %helios_data::tag_to_str(tag), "record init failed: {e}");
                    }
                }
            }
        }
    }

    /// Pins the record without triggering generation or fetch.
    fn pin_raw(&self, tag: Tag) -> Result<DataRef<'_>> {
        let slot = self.slot(tag)?;
        let mut rec = slot.inner.lock().unwrap();
        if rec.payload.is_none() {
            return Err(Error::UnknownTag(tag));
        }
        Ok(self.pin_locked(&slot, &mut rec))
    }

    fn pin_locked(&self, slot: &Arc<RecordSlot>, rec: &mut Record) -> DataRef<'_> {
        rec.pins += 1;
        if rec.lru_slot != NIL {
            self.lru.lock().unwrap().remove(rec.lru_slot);
            rec.lru_slot = NIL;
        }
        let payload = rec.payload.as_ref().expect("pinning a record without payload");
        DataRef {
            db: self,
            slot: slot.clone(),
            ptr: payload.as_ptr(),
            len: payload.size(),
        }
    }

    fn end_access(&self, slot: &RecordSlot) {
        let mut rec = slot.inner.lock().unwrap();
        debug_assert!(rec.pins > 0, "end without matching access");
        rec.pins -= 1;
        if rec.pins == 0 && rec.lru_slot == NIL && self.evictable(&rec) {
            rec.lru_slot = self.lru.lock().unwrap().push(slot.tag);
        }
    }

    fn evictable(&self, rec: &Record) -> bool {
        rec.flags & DB_FLUSHABLE != 0
            && rec.payload.is_some()
            && rec.state == PayloadState::Ready
            && (rec.owner != self.host()
                || self.type_ops(rec.type_code).map(|t| t.generate.is_some()) == Some(true))
    }

    /// Marks the record for re-send to holders at the next flush.
    pub fn dirt(&self, tag: Tag) -> Result<()> {
        let slot = self.slot(tag)?;
        slot.inner.lock().unwrap().dirty = true;
        Ok(())
    }

    /// Pushes one dirty record to the hosts holding a copy.
    pub fn flush(&self, tag: Tag) -> Result<()> {
        let slot = self.slot(tag)?;
        let (dirty, holders) = {
            let rec = slot.inner.lock().unwrap();
            (rec.dirty, rec.holders.clone())
        };
        if !dirty {
            return Ok(());
        }
        if !holders.is_empty() {
            if let Some(peer) = self.peer() {
                peer.flush(tag, &holders)?;
            }
        }
        slot.inner.lock().unwrap().dirty = false;
        Ok(())
    }

    /// Flushes every dirty record.
    pub fn flush_all(&self) -> Result<()> {
        let tags = self.records.read().tags();
        for tag in tags {
            self.flush(tag)?;
        }
        Ok(())
    }

    /// Notes that `host` now holds a copy of the record.
    pub fn add_holder(&self, tag: Tag, host: HostId) -> Result<()> {
        let slot = self.slot(tag)?;
        let mut rec = slot.inner.lock().unwrap();
        if !rec.holders.contains(&host) {
            rec.holders.push(host);
        }
        Ok(())
    }

    /// Drops the local payload copy; the next access re-fetches from the
    /// owner. Applied when the owner flushes a changed record.
    pub fn invalidate(&self, tag: Tag) -> Result<()> {
        let slot = self.slot(tag)?;
        let mut rec = slot.inner.lock().unwrap();
        if rec.owner == self.host() {
            return Ok(());
        }
        if rec.pins > 0 {
            return Err(Error::BusyRecord(tag));
        }
        if rec.lru_slot != NIL {
            self.lru.lock().unwrap().remove(rec.lru_slot);
            rec.lru_slot = NIL;
        }
        if let Some(p) = rec.payload.take() {
            self.mem_used.fetch_sub(p.size(), Ordering::Relaxed);
        }
        rec.state = PayloadState::Remote;
        Ok(())
    }

    /// Marks a record as generated on another host.
    pub fn mark_generated_remote(&self, tag: Tag, host: HostId) -> Result<()> {
        let slot = self.slot(tag)?;
        let mut rec = slot.inner.lock().unwrap();
        if !rec.holders.contains(&host) {
            rec.holders.push(host);
        }
        Ok(())
    }

    /// Type code of a record.
    pub fn type_of(&self, tag: Tag) -> Result<TypeCode> {
        let slot = self.slot(tag)?;
        let rec = slot.inner.lock().unwrap();
        Ok(rec.type_code)
    }

    /// Current payload size of a record.
    pub fn size_of(&self, tag: Tag) -> Result<usize> {
        let slot = self.slot(tag)?;
        let rec = slot.inner.lock().unwrap();
        Ok(rec.payload.as_ref().map(|p| p.size()).unwrap_or(0))
    }

    /// Snapshot of payload bytes plus init state, for transfer to a
    /// peer. Does not trigger generation.
    pub fn snapshot(&self, tag: Tag) -> Result<(TypeCode, Vec<u8>, bool)> {
        let slot = self.slot(tag)?;
        let rec = slot.inner.lock().unwrap();
        let bytes = rec.payload.as_ref().map(|p| p.as_slice().to_vec()).unwrap_or_default();
        Ok((rec.type_code, bytes, rec.state == PayloadState::Ready))
    }

    /// Installs payload bytes fetched from a peer. The payload address
    /// changes, so open leases refuse the install.
    pub fn install_bytes(&self, tag: Tag, bytes: &[u8], inited: bool) -> Result<()> {
        let slot = self.slot(tag)?;
        self.reserve_memory(bytes.len())?;
        let mut rec = slot.inner.lock().unwrap();
        if rec.pins > 0 {
            self.mem_used.fetch_sub(bytes.len(), Ordering::Relaxed);
            return Err(Error::BusyRecord(tag));
        }
        if let Some(p) = rec.payload.take() {
            self.mem_used.fetch_sub(p.size(), Ordering::Relaxed);
        }
        rec.payload = Some(PayloadBuf::from_bytes(bytes));
        rec.state = if inited {
            PayloadState::Ready
        } else {
            PayloadState::Deferred
        };
        Ok(())
    }

    /// Runs the job executor registered for the record's type.
    pub fn execute_job(&self, job: Tag, tls: Tls) -> Result<i32> {
        let type_code = self.type_of(job)?;
        let ops = self.type_ops(type_code).ok_or_else(|| {
            Error::ProtocolViolation(format!("unregistered record type {type_code}"))
        })?;
        let execute = ops.execute.ok_or_else(|| {
            Error::ProtocolViolation(format!("record type {} is not a job", ops.name))
        })?;
        execute(self, job, tls)
    }

    // ---- internals --------------------------------------------------

    fn slot(&self, tag: Tag) -> Result<Arc<RecordSlot>> {
        self.records
            .read()
            .get(tag)
            .cloned()
            .ok_or(Error::UnknownTag(tag))
    }

    fn run_generator(&self, slot: &Arc<RecordSlot>, tag: Tag) -> Result<()> {
        let type_code = {
            let mut rec = slot.inner.lock().unwrap();
            if rec.payload.is_none() {
                self.reserve_memory(0)?;
                rec.payload = Some(PayloadBuf::zeroed(0));
            }
            rec.type_code
        };

        let generate = self
            .type_ops(type_code)
            .and_then(|t| t.generate)
            .ok_or(Error::GenerateFailed(tag))?;

        debug!(tag = %helios_data::tag_to_str(tag), "generating record");
        generate(self, tag, Tls)?;

        if let Some(peer) = self.peer() {
            let _unused = peer.notify_generated(tag);
        }
        Ok(())
    }

    fn fetch_remote(&self, slot: &Arc<RecordSlot>, tag: Tag) -> Result<()> {
        let (owner, type_code) = {
            let rec = slot.inner.lock().unwrap();
            (rec.owner, rec.type_code)
        };
        let peer = self.peer().ok_or(Error::ConnectionLost)?;
        let mut fetched = peer.fetch(tag, owner)?;
        if peer.need_byteswap() {
            self.byteswap(type_code, &mut fetched.bytes);
        }
        self.install_bytes(tag, &fetched.bytes, true)?;
        if !fetched.inited {
            // The owner had not generated it either; run ours.
            let mut rec = slot.inner.lock().unwrap();
            rec.state = PayloadState::Deferred;
            drop(rec);
            return self.run_generator(slot, tag);
        }
        Ok(())
    }

    fn reserve_memory(&self, additional: usize) -> Result<()> {
        let used = self.mem_used.fetch_add(additional, Ordering::Relaxed) + additional;
        if used > self.mem_limit {
            let need = used - self.mem_limit;
            let freed = self.evict(need);
            if freed < need {
                self.mem_used.fetch_sub(additional, Ordering::Relaxed);
                return Err(Error::OutOfMemory);
            }
        }
        Ok(())
    }

    /// Drops unpinned flushable payloads in LRU order until `need`
    /// bytes are reclaimed. Returns the number of bytes freed.
    fn evict(&self, need: usize) -> usize {
        let candidates = self.lru.lock().unwrap().candidates();
        let mut freed = 0usize;

        for tag in candidates {
            if freed >= need {
                break;
            }
            let Ok(slot) = self.slot(tag) else { continue };
            let Ok(mut rec) = slot.inner.try_lock() else {
                continue;
            };
            if rec.pins != 0 || rec.lru_slot == NIL {
                continue;
            }
            let Some(payload) = rec.payload.take() else {
                continue;
            };
            self.lru.lock().unwrap().remove(rec.lru_slot);
            rec.lru_slot = NIL;
            rec.state = if rec.owner == self.host() {
                PayloadState::Deferred
            } else {
                PayloadState::Remote
            };
            let size = payload.size();
            self.mem_used.fetch_sub(size, Ordering::Relaxed);
            freed += size;
            debug!(tag = %helios_data::tag_to_str(tag), size, "evicted payload");
        }
        freed
    }
}

/// Access lease over one record. The payload address is pinned and
/// stable until the lease drops.
pub struct DataRef<'db> {
    db: &'db Database,
    slot: Arc<RecordSlot>,
    ptr: *mut u8,
    len: usize,
}

impl<'db> DataRef<'db> {
    pub fn tag(&self) -> Tag {
        self.slot.tag
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn as_mut_slice(&self) -> &mut [u8] {
        if self.len == 0 {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
        }
    }

    /// In-place view of the payload head as a typed value.
    pub fn get<T: DbValue>(&self) -> &T {
        self.get_at(0)
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get_mut<T: DbValue>(&self) -> &mut T {
        self.get_at_mut(0)
    }

    /// Typed view at a byte offset.
    pub fn get_at<T: DbValue>(&self, offset: usize) -> &T {
        assert!(offset + std::mem::size_of::<T>() <= self.len);
        debug_assert_eq!((self.ptr as usize + offset) % std::mem::align_of::<T>(), 0);
        unsafe { &*(self.ptr.add(offset) as *const T) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get_at_mut<T: DbValue>(&self, offset: usize) -> &mut T {
        assert!(offset + std::mem::size_of::<T>() <= self.len);
        debug_assert_eq!((self.ptr as usize + offset) % std::mem::align_of::<T>(), 0);
        unsafe { &mut *(self.ptr.add(offset) as *mut T) }
    }

    /// Reallocates the payload to `new_size`, preserving the common
    /// prefix. Derived pointers must be reacquired from the returned
    /// lease.
    pub fn resize(self, new_size: usize) -> Result<DataRef<'db>> {
        let db = self.db;
        let slot = self.slot.clone();

        let mut rec = slot.inner.lock().unwrap();
        debug_assert_eq!(rec.pins, 1, "resize with shared leases");

        let old = rec.payload.as_ref().expect("resize of absent payload");
        let old_size = old.size();
        if new_size > old_size {
            db.reserve_memory(new_size - old_size)?;
        } else {
            db.mem_used.fetch_sub(old_size - new_size, Ordering::Relaxed);
        }
        let grown = old.resize_preserving(new_size);
        let ptr = grown.as_ptr();
        rec.payload = Some(grown);
        drop(rec);

        // Hand pin ownership to the new lease.
        std::mem::forget(self);
        Ok(DataRef {
            db,
            slot,
            ptr,
            len: new_size,
        })
    }

    /// Marks the record dirty through an open write lease.
    pub fn dirt(&self) {
        self.slot.inner.lock().unwrap().dirty = true;
    }
}

impl Drop for DataRef<'_> {
    fn drop(&mut self) {
        self.db.end_access(&self.slot);
    }
}

/// Type codes reserved by the runtime. Render pipelines register their
/// own types starting at [`builtin::FIRST_USER_TYPE`].
pub mod builtin {
    use super::{array, table, Database, TypeOps};
    use helios_data::{swap, TypeCode};

    pub const TYPE_DATA_ARRAY: TypeCode = 1;
    pub const TYPE_TABLE: TypeCode = 2;
    pub const TYPE_TABLE_BLOCK: TypeCode = 3;
    pub const TYPE_TAG: TypeCode = 4;
    pub const TYPE_INT: TypeCode = 5;
    pub const TYPE_SCALAR: TypeCode = 6;
    pub const TYPE_VECTOR: TypeCode = 7;
    pub const TYPE_NODE_DESC: TypeCode = 8;
    pub const TYPE_NODE: TypeCode = 9;
    pub const TYPE_PARAM_TABLE: TypeCode = 10;

    /// First code available to pipeline crates.
    pub const FIRST_USER_TYPE: TypeCode = 16;

    fn swap_one_u32(_db: &Database, bytes: &mut [u8]) {
        swap::swap32(bytes);
    }

    fn swap_vector(_db: &Database, bytes: &mut [u8]) {
        swap::swap_fields(bytes, 4, 3);
    }

    /// Installs the runtime's own types. Every database gets this at
    /// startup, before any pipeline types.
    pub fn register(db: &Database) {
        db.register_type(TYPE_DATA_ARRAY, TypeOps {
            name: "data_array",
            atomic_size: 0,
            byteswap: Some(array::byteswap),
            generate: None,
            execute: None,
        });
        db.register_type(TYPE_TABLE, TypeOps {
            name: "data_table",
            atomic_size: 0,
            byteswap: Some(table::byteswap),
            generate: None,
            execute: None,
        });
        db.register_type(TYPE_TABLE_BLOCK, TypeOps::opaque("table_block"));
        db.register_type(TYPE_TAG, TypeOps::atomic("tag", 4, Some(swap_one_u32)));
        db.register_type(TYPE_INT, TypeOps::atomic("int", 4, Some(swap_one_u32)));
        db.register_type(TYPE_SCALAR, TypeOps::atomic("scalar", 4, Some(swap_one_u32)));
        db.register_type(TYPE_VECTOR, TypeOps::atomic("vector", 12, Some(swap_vector)));
    }
}
