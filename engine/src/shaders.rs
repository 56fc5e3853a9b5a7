// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Built-in surface shaders. The full shader library ships as plugin
//! modules; the matte model lives here so a bare install renders.

use std::sync::Arc;

use helios_data::geom::Color;
use helios_data::shade::{ShadeResult, ShadeState};
use helios_data::{Tag, NULL_TAG};
use helios_runtime::db::array;
use helios_runtime::error::Result;
use helios_runtime::nodesys::shader::{Shader, ShaderCtx, ShaderRegistry};

use crate::trace;
use crate::types::LightInst;

/// Lambert surface lit by the pass's light list, with shadow rays.
pub struct MatteShader;

impl Shader for MatteShader {
    fn main(
        &self,
        ctx: &ShaderCtx<'_>,
        state: &mut ShadeState,
        result: &mut ShadeResult,
    ) -> Result<()> {
        let diffuse = ctx.params.color("diffuse", Color::gray(0.8));
        let albedo = diffuse * std::f32::consts::FRAC_1_PI;

        if state.lights != NULL_TAG {
            let count = array::size(ctx.db, state.lights)?;
            for i in 0..count {
                let light_tag: Tag = array::get(ctx.db, state.lights, i)?;
                let light = {
                    let lease = ctx.db.access(light_tag)?;
                    *lease.get::<LightInst>()
                };
                result.color += sample_light(ctx, state, &light, albedo)?;
            }
        }

        result.opacity = Color::gray(1.0);
        Ok(())
    }
}

fn sample_light(
    ctx: &ShaderCtx<'_>,
    state: &ShadeState,
    light: &LightInst,
    albedo: Color,
) -> Result<Color> {
    let to_light = light.origin - state.position;
    let dist2 = to_light.length_squared();
    if dist2 <= 1e-8 {
        return Ok(Color::default());
    }
    let wi = to_light * (1.0 / dist2.sqrt());
    let cos = state.normal.dot(wi);
    if cos <= 0.0 {
        return Ok(Color::default());
    }

    // A null scene list means no shadow rays.
    if state.scene != NULL_TAG
        && trace::occluded(ctx.db, state.scene, state.position, light.origin)?
    {
        return Ok(Color::default());
    }

    Ok(albedo * light.energy * (cos / dist2))
}

/// Installs the built-in shaders into a registry.
pub fn register_builtin(registry: &ShaderRegistry) {
    registry.register("matte", Arc::new(MatteShader));
}
