// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Whole-pipeline renders against a tiny scene: one triangle, one
//! point light, one matte material.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use helios_data::geom::{Color, Mat4, Rect, Vec3};
use helios_data::shade::{ShadeResult, ShadeState};
use helios_data::Tag;
use helios_engine::buffer;
use helios_engine::connection::Connection;
use helios_engine::output::OutputDriver;
use helios_engine::render::Renderer;
use helios_engine::scene::SceneCtx;
use helios_runtime::db::Database;
use helios_runtime::error::Error;
use helios_runtime::nodesys::shader::{Shader, ShaderCtx};
use helios_runtime::nodesys::{DescBuilder, ParamValue, StorageClass};
use helios_runtime::Config;

fn local_config(nthreads: usize) -> Config {
    Config {
        nthreads,
        distributed: false,
        ..Config::default()
    }
}

/// One triangle facing +z, a light colocated with the camera at z = 5.
fn build_scene(ctx: &SceneCtx, res_x: i32, res_y: i32, bucket: i32) -> (Tag, Tag, Tag) {
    let obj = ctx
        .create_polyobject(
            &[
                Vec3::new(-2.0, -2.0, 0.0),
                Vec3::new(2.0, -2.0, 0.0),
                Vec3::new(0.0, 2.0, 0.0),
            ],
            &[0, 1, 2],
        )
        .unwrap();

    let shader = ctx.create_shader("matte").unwrap();
    let material = ctx.create_material().unwrap();
    ctx.add_shader(material, shader).unwrap();

    let inst = ctx.create_instance(obj).unwrap();
    ctx.set(inst, "material", ParamValue::Tag(material)).unwrap();

    let light = ctx.create_light().unwrap();
    ctx.set(light, "origin", ParamValue::Vector(Vec3::new(0.0, 0.0, 5.0)))
        .unwrap();
    ctx.set(light, "intensity", ParamValue::Scalar(31.0)).unwrap();
    let light_inst = ctx.create_instance(light).unwrap();

    let camera = ctx.create_camera().unwrap();
    let cam_inst = ctx.create_instance(camera).unwrap();
    ctx.set_matrix(cam_inst, "transform", Mat4::translation(Vec3::new(0.0, 0.0, 5.0)))
        .unwrap();

    let root = ctx.create_instgroup().unwrap();
    ctx.add_instance(root, inst).unwrap();
    ctx.add_instance(root, light_inst).unwrap();

    let options = ctx.create_options().unwrap();
    ctx.set(options, "res_x", ParamValue::Int(res_x)).unwrap();
    ctx.set(options, "res_y", ParamValue::Int(res_y)).unwrap();
    ctx.set(options, "bucket_size", ParamValue::Int(bucket)).unwrap();

    (root, options, cam_inst)
}

/// Captures the frame buffer at output time.
#[derive(Default)]
struct Capture {
    pixels: Mutex<Vec<[f32; 4]>>,
    size: Mutex<(i32, i32)>,
}

impl OutputDriver for Capture {
    fn write(
        &self,
        db: &Database,
        color_fb: Tag,
        _opacity_fb: Tag,
        _options: Tag,
        _camera: Tag,
    ) -> helios_runtime::Result<()> {
        let (w, h) = buffer::framebuffer_size(db, color_fb)?;
        let mut pixels = vec![];
        for y in 0..h {
            for x in 0..w {
                pixels.push(buffer::read_pixel(db, color_fb, x, y)?);
            }
        }
        *self.pixels.lock().unwrap() = pixels;
        *self.size.lock().unwrap() = (w, h);
        Ok(())
    }
}

#[test]
fn test_single_tile_render() {
    let mut renderer = Renderer::new(local_config(1)).unwrap();
    let (root, options, cam_inst) = build_scene(renderer.scene(), 8, 8, 8);
    renderer.set_scene(root);

    let capture = Capture::default();
    renderer.render(options, cam_inst, &capture).unwrap();

    let pixels = capture.pixels.lock().unwrap();
    assert_eq!(*capture.size.lock().unwrap(), (8, 8));
    assert_eq!(pixels.len(), 64);

    // Center pixel: lit matte surface.
    let center = pixels[(4 * 8 + 4) as usize];
    let luminance = 0.2126 * center[0] + 0.7152 * center[1] + 0.0722 * center[2];
    assert!(
        (0.2..=0.4).contains(&luminance),
        "center luminance {luminance} out of range"
    );
    assert!(center[3] > 0.99, "center must be covered");

    // A corner ray misses the triangle entirely.
    let corner = pixels[0];
    assert_eq!(corner, [0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_multi_bucket_matches_single_bucket() {
    let mut one = Renderer::new(local_config(1)).unwrap();
    let (root, options, cam) = build_scene(one.scene(), 16, 16, 16);
    one.set_scene(root);
    let whole = Capture::default();
    one.render(options, cam, &whole).unwrap();

    let mut many = Renderer::new(local_config(4)).unwrap();
    let (root, options, cam) = build_scene(many.scene(), 16, 16, 4);
    many.set_scene(root);
    let tiled = Capture::default();
    many.render(options, cam, &tiled).unwrap();

    let a = whole.pixels.lock().unwrap();
    let b = tiled.pixels.lock().unwrap();
    assert_eq!(a.len(), b.len());
    for (pa, pb) in a.iter().zip(b.iter()) {
        for c in 0..4 {
            assert!(
                (pa[c] - pb[c]).abs() <= 1e-4,
                "bucketing changed the image: {pa:?} vs {pb:?}"
            );
        }
    }
}

struct AbortingConnection {
    tiles: AtomicUsize,
}

impl Connection for AbortingConnection {
    fn progress(&self, _percent: f32) -> bool {
        self.tiles.load(Ordering::SeqCst) == 0
    }

    fn update_tile(&self, _db: &Database, _color: Tag, _opacity: Tag, _rect: Rect) {
        self.tiles.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_abort_mid_render() {
    let mut renderer = Renderer::new(local_config(2)).unwrap();
    // 8 buckets of 8x8.
    let (root, options, cam) = build_scene(renderer.scene(), 32, 16, 8);
    renderer.set_scene(root);

    let conn = Arc::new(AbortingConnection {
        tiles: AtomicUsize::new(0),
    });
    renderer.set_connection(conn.clone());

    let capture = Capture::default();
    let result = renderer.render(options, cam, &capture);
    assert!(matches!(result, Err(Error::Aborted)));

    // One tile triggered the abort; each of the two threads may have
    // had one more in flight, plus a just-dequeued one as grace.
    let tiles = conn.tiles.load(Ordering::SeqCst);
    assert!(
        (1..=4).contains(&tiles),
        "{tiles} tiles completed after abort"
    );

    // The partial image still reached the output driver.
    assert_eq!(capture.pixels.lock().unwrap().len(), 32 * 16);
}

/// Constant shader counting its invocations, one per surface sample.
static SHADE_CALLS: AtomicUsize = AtomicUsize::new(0);

struct CountingFlat;

impl Shader for CountingFlat {
    fn main(
        &self,
        _ctx: &ShaderCtx<'_>,
        _state: &mut ShadeState,
        result: &mut ShadeResult,
    ) -> helios_runtime::Result<()> {
        SHADE_CALLS.fetch_add(1, Ordering::SeqCst);
        result.color = Color::gray(0.5);
        result.opacity = Color::gray(1.0);
        Ok(())
    }
}

/// Builds the triangle scene on a counting shader with a wide filter,
/// so edge pixels see mixed samples.
fn build_adaptive_scene(ctx: &SceneCtx, instance_max_samples: Option<i32>) -> (Tag, Tag, Tag) {
    helios_engine::env()
        .shaders
        .register("count_flat", Arc::new(CountingFlat));
    ctx.add_descriptor(
        "count_flat",
        DescBuilder::new("count_flat").param(
            StorageClass::Constant,
            "diffuse",
            ParamValue::Color(Color::gray(0.5)),
        ),
    )
    .unwrap();

    let (root, options, cam) = build_scene(ctx, 8, 8, 8);
    ctx.set(options, "filter_radius", ParamValue::Scalar(1.0)).unwrap();
    ctx.set(options, "min_samples", ParamValue::Int(1)).unwrap();
    ctx.set(options, "max_samples", ParamValue::Int(16)).unwrap();

    // Rebind the object's material to the counting shader.
    let shader = ctx.create_shader("count_flat").unwrap();
    let material = ctx.create_material().unwrap();
    ctx.add_shader(material, shader).unwrap();

    let elements = ctx.get(root, "elements").unwrap().as_tag().unwrap();
    let object_inst: Tag = helios_runtime::db::array::get(&ctx.db, elements, 0).unwrap();
    ctx.set(object_inst, "material", ParamValue::Tag(material)).unwrap();
    if let Some(max) = instance_max_samples {
        ctx.set(object_inst, "max_samples", ParamValue::Int(max)).unwrap();
    }

    (root, options, cam)
}

fn count_shader_calls(contrast: f32, instance_max_samples: Option<i32>) -> usize {
    let mut renderer = Renderer::new(local_config(1)).unwrap();
    let (root, options, cam) = build_adaptive_scene(renderer.scene(), instance_max_samples);
    renderer
        .scene()
        .set(options, "contrast", ParamValue::Scalar(contrast))
        .unwrap();
    renderer.set_scene(root);

    SHADE_CALLS.store(0, Ordering::SeqCst);
    renderer.render(options, cam, &Capture::default()).unwrap();
    SHADE_CALLS.load(Ordering::SeqCst)
}

#[test]
fn test_adaptive_sampling_scales_work() {
    // A loose contrast stops every pixel at the sample floor.
    let loose = count_shader_calls(1000.0, None);
    // A strict contrast keeps edge pixels sampling to the ceiling.
    let strict = count_shader_calls(0.0, None);
    assert!(loose > 0);
    assert!(
        strict > loose,
        "contrast must drive extra samples: strict {strict} vs loose {loose}"
    );

    // A per-instance ceiling wins over the global one.
    let capped = count_shader_calls(0.0, Some(1));
    assert!(
        capped < strict,
        "instance sample ceiling must cut work: capped {capped} vs strict {strict}"
    );
}

#[test]
fn test_globillum_adds_light() {
    let mut direct = Renderer::new(local_config(2)).unwrap();
    let (root, options, cam) = build_scene(direct.scene(), 8, 8, 8);
    direct.set_scene(root);
    let plain = Capture::default();
    direct.render(options, cam, &plain).unwrap();

    let mut gi = Renderer::new(local_config(2)).unwrap();
    let (root, options, cam) = build_scene(gi.scene(), 8, 8, 8);
    gi.scene()
        .set(options, "globillum_photons", ParamValue::Int(4096))
        .unwrap();
    gi.set_scene(root);
    let lit = Capture::default();
    gi.render(options, cam, &lit).unwrap();

    let a = plain.pixels.lock().unwrap();
    let b = lit.pixels.lock().unwrap();
    let sum = |p: &Vec<[f32; 4]>| -> f32 { p.iter().map(|px| px[0] + px[1] + px[2]).sum() };
    assert!(
        sum(&b) >= sum(&a),
        "photon map must not remove energy"
    );
}

#[test]
fn test_finalgather_render_completes() {
    let mut renderer = Renderer::new(local_config(2)).unwrap();
    let (root, options, cam) = build_scene(renderer.scene(), 8, 8, 8);
    renderer
        .scene()
        .set(options, "globillum_photons", ParamValue::Int(1024))
        .unwrap();
    renderer
        .scene()
        .set(options, "finalgather", ParamValue::Int(1))
        .unwrap();
    renderer
        .scene()
        .set(options, "fg_rays", ParamValue::Int(8))
        .unwrap();
    renderer.set_scene(root);

    let capture = Capture::default();
    renderer.render(options, cam, &capture).unwrap();

    let pixels = capture.pixels.lock().unwrap();
    let center = pixels[(4 * 8 + 4) as usize];
    assert!(center[3] > 0.99);
}
