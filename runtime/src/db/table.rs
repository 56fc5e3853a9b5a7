// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Block-indexed table for append-heavy data. Each block is its own
//! record sized up front, so growing the table never moves items that
//! are already stored; the table record only keeps the ordered list of
//! block tags. Items per block is a power of two, making the index
//! split a shift and a mask.

use helios_data::{swap, Tag, TypeCode};

use crate::db::{array, DataRef, Database, DbValue};
use crate::error::Result;

#[derive(Clone, Copy)]
#[repr(C)]
struct TableHead {
    item_type: TypeCode,
    item_count: i32,
    items_per_slot: i32,
    slot_shift: i32,
    blocks: Tag,
    _pad: [u32; 3],
}

unsafe impl DbValue for TableHead {}

fn floor_pow2(n: usize) -> (i32, i32) {
    let mut items = 1usize;
    let mut shift = 0i32;
    while items * 2 <= n.max(1) {
        items *= 2;
        shift += 1;
    }
    (items as i32, shift)
}

/// Creates an empty table of `item_type` items.
pub fn create(db: &Database, item_type: TypeCode, items_per_slot: usize) -> Result<Tag> {
    let (items_per_slot, slot_shift) = floor_pow2(items_per_slot);
    let blocks = array::create(db, super::builtin::TYPE_TAG)?;

    let (tag, lease) = db.create(
        super::builtin::TYPE_TABLE,
        std::mem::size_of::<TableHead>(),
        0,
    )?;
    *lease.get_mut::<TableHead>() = TableHead {
        item_type,
        item_count: 0,
        items_per_slot,
        slot_shift,
        blocks,
        _pad: [0; 3],
    };
    Ok(tag)
}

/// Deletes the table along with every block it owns.
pub fn delete(db: &Database, tag: Tag) -> Result<()> {
    let head = head_of(db, tag)?;
    let block_count = array::size(db, head.blocks)?;
    for i in 0..block_count {
        let block: Tag = array::get(db, head.blocks, i)?;
        db.delete(block)?;
    }
    array::delete(db, head.blocks)?;
    db.delete(tag)
}

fn head_of(db: &Database, tag: Tag) -> Result<TableHead> {
    let lease = db.access(tag)?;
    Ok(*lease.get::<TableHead>())
}

pub fn size(db: &Database, tag: Tag) -> Result<usize> {
    Ok(head_of(db, tag)?.item_count as usize)
}

pub fn is_empty(db: &Database, tag: Tag) -> Result<bool> {
    Ok(size(db, tag)? == 0)
}

pub fn item_type(db: &Database, tag: Tag) -> Result<TypeCode> {
    Ok(head_of(db, tag)?.item_type)
}

pub fn items_per_slot(db: &Database, tag: Tag) -> Result<usize> {
    Ok(head_of(db, tag)?.items_per_slot as usize)
}

/// Appends one item. Callers serialize concurrent appends; readers of
/// existing items are never disturbed.
pub fn push<T: DbValue>(db: &Database, tag: Tag, value: T) -> Result<usize> {
    let head = head_of(db, tag)?;
    let isize = std::mem::size_of::<T>();
    debug_assert_eq!(db.type_size(head.item_type), isize);

    let index = head.item_count as usize;
    let sub = index & (head.items_per_slot as usize - 1);

    let block = if sub == 0 {
        // Back block is full; start a new one.
        let (block, lease) = db.create(
            super::builtin::TYPE_TABLE_BLOCK,
            head.items_per_slot as usize * isize,
            0,
        )?;
        drop(lease);
        array::push(db, head.blocks, block)?;
        block
    } else {
        let slot = index >> head.slot_shift;
        array::get(db, head.blocks, slot)?
    };

    let lease = db.access(block)?;
    *lease.get_at_mut::<T>(sub * isize) = value;
    drop(lease);

    let lease = db.access(tag)?;
    lease.get_mut::<TableHead>().item_count += 1;
    lease.dirt();
    Ok(index)
}

/// Copies out the item at `index`.
pub fn get<T: DbValue>(db: &Database, tag: Tag, index: usize) -> Result<T> {
    Ok(*read::<T>(db, tag, index)?)
}

/// Overwrites the item at `index`.
pub fn set<T: DbValue>(db: &Database, tag: Tag, index: usize, value: T) -> Result<()> {
    let head = head_of(db, tag)?;
    let (block, sub) = locate(db, &head, index)?;
    let lease = db.access(block)?;
    *lease.get_at_mut::<T>(sub * std::mem::size_of::<T>()) = value;
    lease.dirt();
    Ok(())
}

fn locate(db: &Database, head: &TableHead, index: usize) -> Result<(Tag, usize)> {
    assert!(index < head.item_count as usize, "table index out of range");
    let slot = index >> head.slot_shift;
    let sub = index & (head.items_per_slot as usize - 1);
    Ok((array::get(db, head.blocks, slot)?, sub))
}

/// Item reference pinning the containing block. The pointer stays valid
/// for the life of this lease no matter how much is appended after it.
pub struct ItemRef<'db, T> {
    lease: DataRef<'db>,
    offset: usize,
    _item: std::marker::PhantomData<T>,
}

impl<T: DbValue> std::ops::Deref for ItemRef<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.lease.get_at::<T>(self.offset)
    }
}

/// Pins the block containing `index` and returns the item in place.
pub fn read<T: DbValue>(db: &Database, tag: Tag, index: usize) -> Result<ItemRef<'_, T>> {
    let head = head_of(db, tag)?;
    let (block, sub) = locate(db, &head, index)?;
    let lease = db.access(block)?;
    Ok(ItemRef {
        lease,
        offset: sub * std::mem::size_of::<T>(),
        _item: std::marker::PhantomData,
    })
}

/// Drops all items, keeping the table itself.
pub fn clear(db: &Database, tag: Tag) -> Result<()> {
    let head = head_of(db, tag)?;
    let block_count = array::size(db, head.blocks)?;
    for i in 0..block_count {
        let block: Tag = array::get(db, head.blocks, i)?;
        db.delete(block)?;
    }
    array::clear(db, head.blocks)?;
    let lease = db.access(tag)?;
    lease.get_mut::<TableHead>().item_count = 0;
    lease.dirt();
    Ok(())
}

/// Header byte-swap; blocks are rebuilt per host rather than shipped.
pub fn byteswap(_db: &Database, bytes: &mut [u8]) {
    for field in 0..5 {
        swap::swap32(&mut bytes[field * 4..field * 4 + 4]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::builtin;

    fn test_db() -> Database {
        let db = Database::new(0);
        builtin::register(&db);
        db
    }

    #[test]
    fn test_push_get_across_blocks() {
        let db = test_db();
        let tab = create(&db, builtin::TYPE_INT, 8).unwrap();
        assert_eq!(items_per_slot(&db, tab).unwrap(), 8);

        for i in 0..100i32 {
            assert_eq!(push(&db, tab, i * 7).unwrap(), i as usize);
        }
        assert_eq!(size(&db, tab).unwrap(), 100);
        for i in 0..100usize {
            assert_eq!(get::<i32>(&db, tab, i).unwrap(), i as i32 * 7);
        }
    }

    #[test]
    fn test_pointer_stability_under_append() {
        let db = test_db();
        let tab = create(&db, builtin::TYPE_INT, 4).unwrap();
        push(&db, tab, 41i32).unwrap();

        let item = read::<i32>(&db, tab, 0).unwrap();
        let p = &*item as *const i32;
        for i in 0..500i32 {
            push(&db, tab, i).unwrap();
        }
        assert_eq!(&*item as *const i32, p);
        assert_eq!(*item, 41);
    }

    #[test]
    fn test_items_per_slot_rounding() {
        let db = test_db();
        let tab = create(&db, builtin::TYPE_INT, 6).unwrap();
        assert_eq!(items_per_slot(&db, tab).unwrap(), 4);
    }

    #[test]
    fn test_single_item_blocks_match_array_semantics() {
        let db = test_db();
        let tab = create(&db, builtin::TYPE_INT, 1).unwrap();
        for i in 0..20i32 {
            push(&db, tab, i).unwrap();
        }
        let items: Vec<i32> = (0..20).map(|i| get(&db, tab, i).unwrap()).collect();
        assert_eq!(items, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_set_and_clear() {
        let db = test_db();
        let tab = create(&db, builtin::TYPE_SCALAR, 4).unwrap();
        for _ in 0..10 {
            push(&db, tab, 0.0f32).unwrap();
        }
        set(&db, tab, 9, 2.5f32).unwrap();
        assert_eq!(get::<f32>(&db, tab, 9).unwrap(), 2.5);

        clear(&db, tab).unwrap();
        assert_eq!(size(&db, tab).unwrap(), 0);
        push(&db, tab, 1.0f32).unwrap();
        assert_eq!(size(&db, tab).unwrap(), 1);
    }

    #[test]
    fn test_delete_releases_blocks() {
        let db = test_db();
        let records_before = db.len();
        let tab = create(&db, builtin::TYPE_INT, 4).unwrap();
        for i in 0..64i32 {
            push(&db, tab, i).unwrap();
        }
        delete(&db, tab).unwrap();
        assert_eq!(db.len(), records_before);
    }
}
