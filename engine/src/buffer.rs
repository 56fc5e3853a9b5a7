// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Frame buffers and bucket tiles. A frame buffer is one record owned
//! by the manager; bucket jobs never write it directly. Each job stores
//! its pixels in a tile record of its own, which rides back to the
//! manager with the job and is merged there. Tile assignment keeps
//! regions disjoint, so merging needs no locks.

use helios_data::geom::Rect;
use helios_data::{swap, Tag};
use helios_runtime::db::{Database, DbValue, TypeOps};
use helios_runtime::error::Result;

use crate::types::{TYPE_FRAMEBUFFER, TYPE_TILE};

pub const CHANNELS: usize = 4;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct FbHead {
    width: i32,
    height: i32,
    channels: i32,
    _pad: u32,
}
unsafe impl DbValue for FbHead {}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct TileHead {
    rect: Rect,
}
unsafe impl DbValue for TileHead {}

const FB_HEAD: usize = std::mem::size_of::<FbHead>();
const TILE_HEAD: usize = std::mem::size_of::<TileHead>();

/// Creates a zeroed RGBA frame buffer.
pub fn create_framebuffer(db: &Database, width: i32, height: i32) -> Result<Tag> {
    let size = FB_HEAD + (width * height) as usize * CHANNELS * 4;
    let (tag, lease) = db.create(TYPE_FRAMEBUFFER, size, 0)?;
    *lease.get_mut::<FbHead>() = FbHead {
        width,
        height,
        channels: CHANNELS as i32,
        _pad: 0,
    };
    Ok(tag)
}

pub fn framebuffer_size(db: &Database, fb: Tag) -> Result<(i32, i32)> {
    let lease = db.access(fb)?;
    let head = lease.get::<FbHead>();
    Ok((head.width, head.height))
}

/// Reads one pixel.
pub fn read_pixel(db: &Database, fb: Tag, x: i32, y: i32) -> Result<[f32; CHANNELS]> {
    let lease = db.access(fb)?;
    let head = *lease.get::<FbHead>();
    assert!(x >= 0 && x < head.width && y >= 0 && y < head.height);
    let offset = FB_HEAD + ((y * head.width + x) as usize) * CHANNELS * 4;
    Ok(*lease.get_at::<[f32; CHANNELS]>(offset))
}

/// Stores a finished bucket as its own tile record.
pub fn store_tile(db: &Database, rect: Rect, pixels: &[[f32; CHANNELS]]) -> Result<Tag> {
    debug_assert_eq!(pixels.len() as i64, rect.area());
    let size = TILE_HEAD + pixels.len() * CHANNELS * 4;
    let (tag, lease) = db.create(TYPE_TILE, size, 0)?;
    lease.get_mut::<TileHead>().rect = rect;
    for (i, px) in pixels.iter().enumerate() {
        *lease.get_at_mut::<[f32; CHANNELS]>(TILE_HEAD + i * CHANNELS * 4) = *px;
    }
    drop(lease);
    db.dirt(tag)?;
    Ok(tag)
}

pub fn tile_rect(db: &Database, tile: Tag) -> Result<Rect> {
    let lease = db.access(tile)?;
    Ok(lease.get::<TileHead>().rect)
}

/// Merges a tile record into the frame buffer and releases the tile.
pub fn merge_tile(db: &Database, fb: Tag, tile: Tag) -> Result<Rect> {
    let (rect, pixels) = {
        let lease = db.access(tile)?;
        let rect = lease.get::<TileHead>().rect;
        let pixels: Vec<[f32; CHANNELS]> = (0..rect.area() as usize)
            .map(|i| *lease.get_at::<[f32; CHANNELS]>(TILE_HEAD + i * CHANNELS * 4))
            .collect();
        (rect, pixels)
    };

    write_region(db, fb, rect, &pixels)?;
    db.delete(tile)?;
    Ok(rect)
}

/// Merges a tile into the color buffer and its alpha into the opacity
/// buffer, then releases the tile.
pub fn merge_tile_split(db: &Database, color_fb: Tag, opacity_fb: Tag, tile: Tag) -> Result<Rect> {
    let (rect, pixels) = {
        let lease = db.access(tile)?;
        let rect = lease.get::<TileHead>().rect;
        let pixels: Vec<[f32; CHANNELS]> = (0..rect.area() as usize)
            .map(|i| *lease.get_at::<[f32; CHANNELS]>(TILE_HEAD + i * CHANNELS * 4))
            .collect();
        (rect, pixels)
    };

    write_region(db, color_fb, rect, &pixels)?;
    let opacity: Vec<[f32; CHANNELS]> = pixels
        .iter()
        .map(|p| [p[3], p[3], p[3], p[3]])
        .collect();
    write_region(db, opacity_fb, rect, &opacity)?;

    db.delete(tile)?;
    Ok(rect)
}

fn write_region(db: &Database, fb: Tag, rect: Rect, pixels: &[[f32; CHANNELS]]) -> Result<()> {
    let lease = db.access(fb)?;
    let head = *lease.get::<FbHead>();
    for ty in rect.top..rect.bottom {
        for tx in rect.left..rect.right {
            if tx < 0 || tx >= head.width || ty < 0 || ty >= head.height {
                continue;
            }
            let src = ((ty - rect.top) * rect.width() + (tx - rect.left)) as usize;
            let dst = FB_HEAD + ((ty * head.width + tx) as usize) * CHANNELS * 4;
            *lease.get_at_mut::<[f32; CHANNELS]>(dst) = pixels[src];
        }
    }
    drop(lease);
    db.dirt(fb)
}

fn swap_all_fields(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, bytes.len() / 4);
}

pub fn register(db: &Database) {
    db.register_type(TYPE_FRAMEBUFFER, TypeOps {
        name: "framebuffer",
        atomic_size: 0,
        byteswap: Some(swap_all_fields),
        generate: None,
        execute: None,
    });
    db.register_type(TYPE_TILE, TypeOps {
        name: "tile",
        atomic_size: 0,
        byteswap: Some(swap_all_fields),
        generate: None,
        execute: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use helios_runtime::db::builtin;

    fn test_db() -> Database {
        let db = Database::new(0);
        builtin::register(&db);
        register(&db);
        db
    }

    #[test]
    fn test_tile_merge() {
        let db = test_db();
        let fb = create_framebuffer(&db, 8, 8).unwrap();
        assert_eq!(framebuffer_size(&db, fb).unwrap(), (8, 8));

        let rect = Rect::new(2, 4, 2, 4);
        let pixels = vec![[0.5, 0.25, 0.125, 1.0]; 4];
        let tile = store_tile(&db, rect, &pixels).unwrap();
        let merged = merge_tile(&db, fb, tile).unwrap();
        assert_eq!(merged, rect);

        assert_eq!(read_pixel(&db, fb, 2, 2).unwrap(), [0.5, 0.25, 0.125, 1.0]);
        assert_eq!(read_pixel(&db, fb, 3, 3).unwrap(), [0.5, 0.25, 0.125, 1.0]);
        assert_eq!(read_pixel(&db, fb, 4, 4).unwrap(), [0.0; 4]);

        // The tile record is gone after the merge.
        assert!(db.access(tile).is_err());
    }
}
