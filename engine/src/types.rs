// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Compiled scene records. The exporter builds nodes; the scene
//! compiler lowers them into these fixed-layout records that the job
//! executors read directly.

use helios_data::geom::{Color, Mat4, Vec3};
use helios_data::{swap, Tag, TypeCode, NULL_TAG};
use helios_runtime::db::builtin::FIRST_USER_TYPE;
use helios_runtime::db::{Database, DbValue, TypeOps};

pub const TYPE_OPTIONS: TypeCode = FIRST_USER_TYPE;
pub const TYPE_CAMERA: TypeCode = FIRST_USER_TYPE + 1;
pub const TYPE_TESSEL: TypeCode = FIRST_USER_TYPE + 2;
pub const TYPE_LIGHT_INST: TypeCode = FIRST_USER_TYPE + 3;
pub const TYPE_TILE: TypeCode = FIRST_USER_TYPE + 4;
pub const TYPE_FRAMEBUFFER: TypeCode = FIRST_USER_TYPE + 5;
pub const TYPE_PHOTON_MAP: TypeCode = FIRST_USER_TYPE + 6;
pub const TYPE_IRRAD_CACHE: TypeCode = FIRST_USER_TYPE + 7;
pub const TYPE_TESSEL_JOB: TypeCode = FIRST_USER_TYPE + 8;
pub const TYPE_BUCKET_JOB: TypeCode = FIRST_USER_TYPE + 9;
pub const TYPE_PHOTON_JOB: TypeCode = FIRST_USER_TYPE + 10;

/// Pixel filters of the sampler.
pub const FILTER_BOX: i32 = 0;
pub const FILTER_TRIANGLE: i32 = 1;
pub const FILTER_GAUSSIAN: i32 = 2;

/// Render pass of a bucket job.
pub const PASS_FRAME: u32 = 0;
pub const PASS_FINALGATHER_INITIAL: u32 = 1;
pub const PASS_FINALGATHER_REFINE: u32 = 2;

/// Photon kinds.
pub const PHOTON_CAUSTIC: u32 = 0;
pub const PHOTON_GLOBILLUM: u32 = 1;

/// Attribute flag bits.
pub const ATTR_VISIBLE: u32 = 1 << 0;
pub const ATTR_CAST_SHADOW: u32 = 1 << 1;

/// Sentinel for an attribute the instance leaves to its parent.
pub const ATTR_INHERIT: i32 = i32::MAX;

/// Per-instance attribute overrides, composed down the instance DAG.
/// A flag cleared on a parent stays cleared in its children; sample
/// bounds left at the sentinel take the parent's values. The root of
/// the walk is seeded from the global options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Attributes {
    pub flags: u32,
    pub min_samples: i32,
    pub max_samples: i32,
}
unsafe impl DbValue for Attributes {}

impl Default for Attributes {
    fn default() -> Self {
        Attributes::unset()
    }
}

impl Attributes {
    /// Everything left to the parent.
    pub fn unset() -> Attributes {
        Attributes {
            flags: !0,
            min_samples: ATTR_INHERIT,
            max_samples: ATTR_INHERIT,
        }
    }

    /// Root attributes, seeded from the global options.
    pub fn defaults(options: &Options) -> Attributes {
        Attributes {
            flags: !0,
            min_samples: options.min_samples,
            max_samples: options.max_samples,
        }
    }

    /// Fills unset fields from the parent. Cleared parent flags win
    /// over the child's.
    pub fn inherit(&mut self, parent: &Attributes) {
        self.flags &= parent.flags;
        if self.min_samples == ATTR_INHERIT {
            self.min_samples = parent.min_samples;
        }
        if self.max_samples == ATTR_INHERIT {
            self.max_samples = parent.max_samples;
        }
    }

    pub fn visible(&self) -> bool {
        self.flags & ATTR_VISIBLE != 0
    }

    pub fn casts_shadow(&self) -> bool {
        self.flags & ATTR_CAST_SHADOW != 0
    }
}

/// Global render options, compiled from the options node.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Options {
    pub res_x: i32,
    pub res_y: i32,
    pub bucket_size: i32,
    pub min_samples: i32,
    pub max_samples: i32,
    pub filter: i32,
    pub filter_radius: f32,
    /// Luminance span below which a pixel stops taking samples.
    pub contrast: f32,
    pub caustic_photons: i32,
    pub globillum_photons: i32,
    pub max_photons: i32,
    pub finalgather: i32,
    pub fg_rays: i32,
}
unsafe impl DbValue for Options {}

impl Default for Options {
    fn default() -> Self {
        Options {
            res_x: 640,
            res_y: 480,
            bucket_size: 48,
            min_samples: 1,
            max_samples: 4,
            filter: FILTER_BOX,
            filter_radius: 0.0,
            contrast: 0.05,
            caustic_photons: 0,
            globillum_photons: 0,
            max_photons: 100_000,
            finalgather: 0,
            fg_rays: 16,
        }
    }
}

/// Camera compiled from the camera instance.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Camera {
    pub focal: f32,
    pub aperture: f32,
    pub aspect: f32,
    pub clip_near: f32,
    pub clip_far: f32,
    pub _pad: [f32; 3],
    pub cam_to_world: Mat4,
}
unsafe impl DbValue for Camera {}

impl Default for Camera {
    fn default() -> Self {
        Camera {
            focal: 1.0,
            aperture: 2.0,
            aspect: 1.0,
            clip_near: 1e-4,
            clip_far: 1e30,
            _pad: [0.0; 3],
            cam_to_world: Mat4::identity(),
        }
    }
}

/// World-space tessellation of one object instance: a triangle soup
/// whose positions live in a separate vector array.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Tessel {
    /// Data array of world-space vertex positions, 3 per triangle.
    pub positions: Tag,
    pub tri_count: i32,
    /// Shader list of the instance's material.
    pub material: Tag,
    /// Composed instance attributes, already inherited.
    pub attrs: Attributes,
}
unsafe impl DbValue for Tessel {}

/// A light bound into the scene, in world space.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LightInst {
    pub origin: Vec3,
    pub _pad0: f32,
    pub energy: Color,
    /// Total flux used for photon importance sampling.
    pub flux: f32,
}
unsafe impl DbValue for LightInst {}

impl Default for LightInst {
    fn default() -> Self {
        LightInst {
            origin: Vec3::default(),
            _pad0: 0.0,
            energy: Color::gray(1.0),
            flux: 1.0,
        }
    }
}

/// One photon deposited in a map.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Photon {
    pub position: Vec3,
    pub direction: Vec3,
    pub power: Color,
}
unsafe impl DbValue for Photon {}

/// Photon map record: header followed by the photon array.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PhotonMapHead {
    pub count: i32,
    pub kind: u32,
    pub _pad: [u32; 2],
}
unsafe impl DbValue for PhotonMapHead {}

/// One irradiance sample of the final-gather cache.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IrradSample {
    pub position: Vec3,
    pub normal: Vec3,
    pub irradiance: Color,
}
unsafe impl DbValue for IrradSample {}

/// Irradiance cache record: header followed by the samples.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct IrradCacheHead {
    pub count: i32,
    pub _pad: [u32; 3],
}
unsafe impl DbValue for IrradCacheHead {}

/// Everything a render phase needs to find the scene.
#[derive(Debug, Clone, Copy)]
pub struct SceneView {
    pub options: Tag,
    pub camera: Tag,
    /// Data array of light instance tags.
    pub lights: Tag,
    /// Data array of tessellation tags.
    pub tessels: Tag,
    pub caustic_map: Tag,
    pub globillum_map: Tag,
    pub irrad_cache: Tag,
}

impl Default for SceneView {
    fn default() -> Self {
        SceneView {
            options: NULL_TAG,
            camera: NULL_TAG,
            lights: NULL_TAG,
            tessels: NULL_TAG,
            caustic_map: NULL_TAG,
            globillum_map: NULL_TAG,
            irrad_cache: NULL_TAG,
        }
    }
}

// ---- byte-swap ------------------------------------------------------

fn swap_options(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, 13);
}

fn swap_camera(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, std::mem::size_of::<Camera>() / 4);
}

fn swap_tessel(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, std::mem::size_of::<Tessel>() / 4);
}

fn swap_light(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, std::mem::size_of::<LightInst>() / 4);
}

fn swap_photon_map(_db: &Database, bytes: &mut [u8]) {
    // Header plus a homogeneous f32/i32 payload.
    swap::swap_fields(bytes, 4, bytes.len() / 4);
}

pub fn register(db: &Database) {
    db.register_type(TYPE_OPTIONS, TypeOps {
        name: "options",
        atomic_size: 0,
        byteswap: Some(swap_options),
        generate: None,
        execute: None,
    });
    db.register_type(TYPE_CAMERA, TypeOps {
        name: "camera",
        atomic_size: 0,
        byteswap: Some(swap_camera),
        generate: None,
        execute: None,
    });
    db.register_type(TYPE_TESSEL, TypeOps {
        name: "tessel",
        atomic_size: 0,
        byteswap: Some(swap_tessel),
        generate: None,
        execute: None,
    });
    db.register_type(TYPE_LIGHT_INST, TypeOps {
        name: "light_inst",
        atomic_size: 0,
        byteswap: Some(swap_light),
        generate: None,
        execute: None,
    });
    db.register_type(TYPE_PHOTON_MAP, TypeOps {
        name: "photon_map",
        atomic_size: 0,
        byteswap: Some(swap_photon_map),
        generate: None,
        execute: None,
    });
    db.register_type(TYPE_IRRAD_CACHE, TypeOps {
        name: "irrad_cache",
        atomic_size: 0,
        byteswap: Some(swap_photon_map),
        generate: None,
        execute: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_field_aligned() {
        // Byte-swap walks 4-byte fields, so no layout may have padding
        // that is not explicit.
        assert_eq!(std::mem::size_of::<Options>(), 13 * 4);
        assert_eq!(std::mem::size_of::<Camera>(), 32 + 64);
        assert_eq!(std::mem::size_of::<Tessel>(), 24);
        assert_eq!(std::mem::size_of::<Attributes>(), 12);
        assert_eq!(std::mem::size_of::<LightInst>() % 4, 0);
        assert_eq!(std::mem::size_of::<Photon>(), 36);
    }

    #[test]
    fn test_options_swap_round_trip() {
        let db = Database::new(0);
        register(&db);
        let opt = Options {
            res_x: 0x0102_0304,
            ..Default::default()
        };
        let mut bytes = vec![0u8; std::mem::size_of::<Options>()];
        unsafe {
            std::ptr::copy_nonoverlapping(
                &opt as *const Options as *const u8,
                bytes.as_mut_ptr(),
                bytes.len(),
            );
        }
        let original = bytes.clone();
        db.byteswap(TYPE_OPTIONS, &mut bytes);
        assert_ne!(bytes, original);
        db.byteswap(TYPE_OPTIONS, &mut bytes);
        assert_eq!(bytes, original);
    }
}
