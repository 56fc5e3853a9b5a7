// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! The built-in demo scene: a two-triangle floor and a tilted panel
//! under one point light.

use helios_data::geom::{Mat4, Vec3};
use helios_data::Tag;
use helios_engine::scene::SceneCtx;
use helios_runtime::error::Result;
use helios_runtime::nodesys::ParamValue;

pub fn build(ctx: &SceneCtx) -> Result<(Tag, Tag, Tag)> {
    let floor = ctx.create_polyobject(
        &[
            Vec3::new(-4.0, -4.0, 0.0),
            Vec3::new(4.0, -4.0, 0.0),
            Vec3::new(4.0, 4.0, 0.0),
            Vec3::new(-4.0, 4.0, 0.0),
        ],
        &[0, 1, 2, 0, 2, 3],
    )?;

    let panel = ctx.create_polyobject(
        &[
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(0.0, 1.0, 1.5),
        ],
        &[0, 1, 2],
    )?;

    let shader = ctx.create_shader("matte")?;
    let material = ctx.create_material()?;
    ctx.add_shader(material, shader)?;

    let root = ctx.create_instgroup()?;

    let floor_inst = ctx.create_instance(floor)?;
    ctx.set(floor_inst, "material", ParamValue::Tag(material))?;
    ctx.add_instance(root, floor_inst)?;

    let panel_inst = ctx.create_instance(panel)?;
    ctx.set(panel_inst, "material", ParamValue::Tag(material))?;
    ctx.set_matrix(
        panel_inst,
        "transform",
        Mat4::translation(Vec3::new(0.0, 0.0, 0.5)),
    )?;
    ctx.add_instance(root, panel_inst)?;

    let light = ctx.create_light()?;
    ctx.set(light, "origin", ParamValue::Vector(Vec3::new(2.0, -2.0, 6.0)))?;
    ctx.set(light, "intensity", ParamValue::Scalar(40.0))?;
    ctx.add_instance(root, ctx.create_instance(light)?)?;

    let options = ctx.create_options()?;
    ctx.set(options, "res_x", ParamValue::Int(256))?;
    ctx.set(options, "res_y", ParamValue::Int(256))?;
    ctx.set(options, "bucket_size", ParamValue::Int(32))?;

    let camera = ctx.create_camera()?;
    let cam_inst = ctx.create_instance(camera)?;
    ctx.set_matrix(
        cam_inst,
        "transform",
        Mat4::translation(Vec3::new(0.0, 0.0, 8.0)),
    )?;

    Ok((root, options, cam_inst))
}
