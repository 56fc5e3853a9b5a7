// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Shading seam types. A shader instance is a tagged record plus an
//! execute callback over this state; the runtime never looks inside the
//! radiometry.

use crate::geom::{Color, Vec3};
use crate::{Tag, NULL_TAG};

/// Per-intersection shading state handed to shader instances.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ShadeState {
    /// World-space hit position.
    pub position: Vec3,
    /// Shading normal, unit length, facing the incoming ray.
    pub normal: Vec3,
    /// Incident ray direction, unit length, pointing toward the surface.
    pub incident: Vec3,
    /// Surface parametrization at the hit.
    pub u: f32,
    pub v: f32,
    /// Distance along the incident ray.
    pub distance: f32,
    /// Data array of light instance tags visible to this pass.
    pub lights: Tag,
    /// Data array of tessellation tags for secondary rays, or null.
    pub scene: Tag,
    /// Photon map consulted by indirect lookups, or null.
    pub photon_map: Tag,
    /// Ray recursion depth.
    pub depth: u32,
    /// Raster position of the sample being shaded.
    pub raster_x: f32,
    pub raster_y: f32,
}

impl Default for ShadeState {
    fn default() -> Self {
        ShadeState {
            position: Vec3::default(),
            normal: Vec3::new(0.0, 0.0, 1.0),
            incident: Vec3::new(0.0, 0.0, -1.0),
            u: 0.0,
            v: 0.0,
            distance: 0.0,
            lights: NULL_TAG,
            scene: NULL_TAG,
            photon_map: NULL_TAG,
            depth: 0,
            raster_x: 0.0,
            raster_y: 0.0,
        }
    }
}

/// Accumulated result of a shader list execution.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ShadeResult {
    pub color: Color,
    pub opacity: Color,
}
