// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Dynamic array of homogeneous items stored as a single record: a
//! small header followed by the items. The header's `cap` counts free
//! slots beyond `size`; slots past `size` are kept zeroed.

use helios_data::{swap, Tag, TypeCode};

use crate::db::{DataRef, Database, DbValue, DB_FLUSHABLE};
use crate::error::Result;

/// Header bytes preceding the items, padded so items stay aligned.
pub const HEADER: usize = 16;

/// Largest single growth step, in items.
const MAX_RESERVE: i32 = 256;

#[derive(Clone, Copy)]
#[repr(C)]
struct ArrayHead {
    item_type: TypeCode,
    size: i32,
    cap: i32,
    _pad: u32,
}

unsafe impl DbValue for ArrayHead {}

fn item_size(db: &Database, head: &ArrayHead) -> usize {
    let size = db.type_size(head.item_type);
    debug_assert!(size > 0, "array items must be an atomic type");
    size
}

/// Creates an empty array of the given item type.
pub fn create(db: &Database, item_type: TypeCode) -> Result<Tag> {
    let (tag, lease) = db.create(super::builtin::TYPE_DATA_ARRAY, HEADER, DB_FLUSHABLE)?;
    *lease.get_mut::<ArrayHead>() = ArrayHead {
        item_type,
        size: 0,
        cap: 0,
        _pad: 0,
    };
    Ok(tag)
}

pub fn delete(db: &Database, tag: Tag) -> Result<()> {
    db.delete(tag)
}

pub fn size(db: &Database, tag: Tag) -> Result<usize> {
    let lease = db.access(tag)?;
    Ok(lease.get::<ArrayHead>().size as usize)
}

pub fn is_empty(db: &Database, tag: Tag) -> Result<bool> {
    Ok(size(db, tag)? == 0)
}

pub fn item_type(db: &Database, tag: Tag) -> Result<TypeCode> {
    let lease = db.access(tag)?;
    Ok(lease.get::<ArrayHead>().item_type)
}

/// Total slots, allocated plus free.
pub fn capacity(db: &Database, tag: Tag) -> Result<usize> {
    let lease = db.access(tag)?;
    let head = lease.get::<ArrayHead>();
    Ok((head.size + head.cap) as usize)
}

/// Drops all items and releases the item storage.
pub fn clear(db: &Database, tag: Tag) -> Result<()> {
    let lease = db.access(tag)?;
    let lease = lease.resize(HEADER)?;
    let head = lease.get_mut::<ArrayHead>();
    head.size = 0;
    head.cap = 0;
    lease.dirt();
    Ok(())
}

fn reserve_locked<'db>(
    db: &'db Database,
    lease: DataRef<'db>,
    n: i32,
) -> Result<DataRef<'db>> {
    let head = *lease.get::<ArrayHead>();
    if head.cap >= n || n <= 0 {
        return Ok(lease);
    }
    let isize = item_size(db, &head);
    let lease = lease.resize(HEADER + isize * (head.size + n) as usize)?;
    lease.get_mut::<ArrayHead>().cap = n;
    Ok(lease)
}

/// Ensures room for `n` more items without growing the logical size.
pub fn reserve(db: &Database, tag: Tag, n: usize) -> Result<()> {
    let lease = db.access(tag)?;
    reserve_locked(db, lease, n as i32)?.dirt();
    Ok(())
}

/// Appends one item, growing by doubling capped at `MAX_RESERVE`.
pub fn push<T: DbValue>(db: &Database, tag: Tag, value: T) -> Result<usize> {
    let lease = db.access(tag)?;
    let head = *lease.get::<ArrayHead>();
    debug_assert_eq!(item_size(db, &head), std::mem::size_of::<T>());

    let lease = if head.cap <= 0 {
        let grow = head.size.clamp(1, MAX_RESERVE);
        reserve_locked(db, lease, grow)?
    } else {
        lease
    };

    let head = *lease.get::<ArrayHead>();
    let index = head.size as usize;
    *lease.get_at_mut::<T>(HEADER + index * std::mem::size_of::<T>()) = value;
    {
        let head = lease.get_mut::<ArrayHead>();
        head.size += 1;
        head.cap -= 1;
    }
    lease.dirt();
    Ok(index)
}

/// Copies out the item at `index`.
pub fn get<T: DbValue>(db: &Database, tag: Tag, index: usize) -> Result<T> {
    let lease = db.access(tag)?;
    let head = lease.get::<ArrayHead>();
    assert!(index < head.size as usize, "array index out of range");
    Ok(*lease.get_at::<T>(HEADER + index * std::mem::size_of::<T>()))
}

/// Overwrites the item at `index`.
pub fn set<T: DbValue>(db: &Database, tag: Tag, index: usize, value: T) -> Result<()> {
    let lease = db.access(tag)?;
    let head = lease.get::<ArrayHead>();
    assert!(index < head.size as usize, "array index out of range");
    *lease.get_at_mut::<T>(HEADER + index * std::mem::size_of::<T>()) = value;
    lease.dirt();
    Ok(())
}

/// Removes the item at `index`, shifting later items down. Storage is
/// kept; the freed slot returns to the free range zeroed.
pub fn erase(db: &Database, tag: Tag, index: usize) -> Result<()> {
    let lease = db.access(tag)?;
    let head = *lease.get::<ArrayHead>();
    let isize = item_size(db, &head);
    let size = head.size as usize;
    assert!(index < size, "array index out of range");

    let items = &mut lease.as_mut_slice()[HEADER..];
    items.copy_within((index + 1) * isize..size * isize, index * isize);
    items[(size - 1) * isize..size * isize].fill(0);

    let head = lease.get_mut::<ArrayHead>();
    head.size -= 1;
    head.cap += 1;
    lease.dirt();
    Ok(())
}

/// Sets the logical size. Shrinking keeps storage and zeroes the tail;
/// growing reserves the missing part.
pub fn resize_len(db: &Database, tag: Tag, n: usize) -> Result<()> {
    let lease = db.access(tag)?;
    let head = *lease.get::<ArrayHead>();
    let n = n as i32;
    if head.size == n {
        return Ok(());
    }

    if head.size > n {
        let isize = item_size(db, &head);
        lease.as_mut_slice()[HEADER + n as usize * isize..HEADER + head.size as usize * isize]
            .fill(0);
        let head = lease.get_mut::<ArrayHead>();
        head.cap += head.size - n;
        head.size = n;
        lease.dirt();
    } else {
        let lease = reserve_locked(db, lease, n - head.size)?;
        let head = lease.get_mut::<ArrayHead>();
        head.cap -= n - head.size;
        head.size = n;
        lease.dirt();
    }
    Ok(())
}

/// Typed read lease over the whole item range.
pub struct ArrayLease<'db, T> {
    lease: DataRef<'db>,
    len: usize,
    _items: std::marker::PhantomData<T>,
}

impl<T: DbValue> ArrayLease<'_, T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> &T {
        assert!(index < self.len);
        self.lease.get_at::<T>(HEADER + index * std::mem::size_of::<T>())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len).map(move |i| self.get(i))
    }
}

/// Pins the array and returns a typed view of its items.
pub fn lease<T: DbValue>(db: &Database, tag: Tag) -> Result<ArrayLease<'_, T>> {
    let lease = db.access(tag)?;
    let head = lease.get::<ArrayHead>();
    debug_assert_eq!(item_size(db, head), std::mem::size_of::<T>());
    let len = head.size as usize;
    Ok(ArrayLease {
        lease,
        len,
        _items: std::marker::PhantomData,
    })
}

/// Byte-swap of an array payload. Type codes are small integers, so the
/// first field tells whether the header is still in native order (a
/// departing payload) or foreign (an arriving one); items are swapped
/// through their own type either way.
pub fn byteswap(db: &Database, bytes: &mut [u8]) {
    let arriving = u32::from_ne_bytes(bytes[0..4].try_into().unwrap()) > 0xFFFF;
    if arriving {
        swap_header(bytes);
    }

    let item_type = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
    let size = i32::from_ne_bytes(bytes[4..8].try_into().unwrap());
    let isize = db.type_size(item_type);
    if isize > 0 {
        for i in 0..size as usize {
            db.byteswap(item_type, &mut bytes[HEADER + i * isize..HEADER + (i + 1) * isize]);
        }
    }

    if !arriving {
        swap_header(bytes);
    }
}

fn swap_header(bytes: &mut [u8]) {
    swap::swap32(&mut bytes[0..4]);
    swap::swap32(&mut bytes[4..8]);
    swap::swap32(&mut bytes[8..12]);
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
    fn test_push_then_get() {
        let db = test_db();
        let arr = create(&db, builtin::TYPE_SCALAR).unwrap();

        for i in 0..100 {
            let n = size(&db, arr).unwrap();
            assert_eq!(push(&db, arr, i as f32).unwrap(), n);
            assert_eq!(get::<f32>(&db, arr, n).unwrap(), i as f32);
            assert_eq!(size(&db, arr).unwrap(), n + 1);
        }
        assert!(capacity(&db, arr).unwrap() >= 100);
    }

    #[test]
    fn test_growth_is_capped() {
        let db = test_db();
        let arr = create(&db, builtin::TYPE_INT).unwrap();
        for i in 0..2000i32 {
            push(&db, arr, i).unwrap();
        }
        // Doubling stops at the cap, so overshoot stays below one step.
        assert!(capacity(&db, arr).unwrap() <= 2000 + 256);
    }

    #[test]
    fn test_reserve_zero_is_noop() {
        let db = test_db();
        let arr = create(&db, builtin::TYPE_INT).unwrap();
        push(&db, arr, 1i32).unwrap();
        let cap = capacity(&db, arr).unwrap();
        reserve(&db, arr, 0).unwrap();
        assert_eq!(capacity(&db, arr).unwrap(), cap);
    }

    #[test]
    fn test_shrink_is_logical() {
        let db = test_db();
        let arr = create(&db, builtin::TYPE_INT).unwrap();
        for i in 0..10i32 {
            push(&db, arr, i).unwrap();
        }
        let cap = capacity(&db, arr).unwrap();
        resize_len(&db, arr, 4).unwrap();
        assert_eq!(size(&db, arr).unwrap(), 4);
        assert_eq!(capacity(&db, arr).unwrap(), cap);

        // Free range is zeroed, so re-growing exposes zeroes.
        resize_len(&db, arr, 6).unwrap();
        assert_eq!(get::<i32>(&db, arr, 3).unwrap(), 3);
        assert_eq!(get::<i32>(&db, arr, 4).unwrap(), 0);
        assert_eq!(get::<i32>(&db, arr, 5).unwrap(), 0);
    }

    #[test]
    fn test_erase_shifts() {
        let db = test_db();
        let arr = create(&db, builtin::TYPE_INT).unwrap();
        for i in 0..5i32 {
            push(&db, arr, i).unwrap();
        }
        erase(&db, arr, 1).unwrap();
        let items: Vec<i32> = (0..4).map(|i| get(&db, arr, i).unwrap()).collect();
        assert_eq!(items, vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_byteswap_round_trip() {
        let db = test_db();
        let arr = create(&db, builtin::TYPE_INT).unwrap();
        for i in 0..7i32 {
            push(&db, arr, i * 1000).unwrap();
        }

        let (type_code, mut bytes, _) = db.snapshot(arr).unwrap();
        db.byteswap(type_code, &mut bytes);
        db.byteswap(type_code, &mut bytes);
        let (_, original, _) = db.snapshot(arr).unwrap();
        assert_eq!(bytes, original);
    }

    #[test]
    fn test_typed_lease() {
        let db = test_db();
        let arr = create(&db, builtin::TYPE_VECTOR).unwrap();
        use helios_data::geom::Vec3;
        push(&db, arr, Vec3::new(1.0, 2.0, 3.0)).unwrap();
        push(&db, arr, Vec3::new(4.0, 5.0, 6.0)).unwrap();

        let view = lease::<Vec3>(&db, arr).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(1).y, 5.0);
        assert_eq!(view.iter().count(), 2);
    }
}
