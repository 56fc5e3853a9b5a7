// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Bucket jobs: render one image tile. The executor samples every
//! pixel of its rectangle into thread-local scratch and stores the
//! finished tile as a record of its own; the manager merges tiles into
//! the frame buffers as the jobs complete. Abort is polled per
//! scanline.

use helios_data::geom::{Color, Rect, Vec3};
use helios_data::shade::{ShadeResult, ShadeState};
use helios_data::{swap, Tag, NULL_TAG};
use helios_runtime::db::{Database, DbValue, TypeOps};
use helios_runtime::error::Result;
use helios_runtime::scheduler::{JOB_ABORTED, JOB_OK};
use helios_runtime::tls::Tls;

use crate::buffer;
use crate::photon::PhotonIndex;
use crate::sampler::{FilterTable, PixelAccum};
use crate::trace::{self, Ray};
use crate::types::{
    Attributes, Camera, IrradCacheHead, IrradSample, Options, PASS_FINALGATHER_INITIAL,
    PASS_FINALGATHER_REFINE, TYPE_BUCKET_JOB, TYPE_IRRAD_CACHE,
};
use crate::{qmc, EngineEnv};

/// Coarse grid step of the initial final-gather pass.
const FG_GRID: i32 = 4;

/// Photon gather radius.
const GATHER_RADIUS: f32 = 1.0;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BucketJob {
    pub rect: Rect,
    pub pass: u32,
    pub _pad: u32,
    pub options: Tag,
    pub camera: Tag,
    /// Data array of light instance tags.
    pub lights: Tag,
    /// Data array of tessellation tags.
    pub tessels: Tag,
    pub photon_map: Tag,
    pub irrad_cache: Tag,
    /// Tile (or final-gather batch) record, filled by the executor.
    pub output: Tag,
    pub _pad2: u32,
}
unsafe impl DbValue for BucketJob {}

pub fn create_job(db: &Database, job: BucketJob) -> Result<Tag> {
    let (tag, lease) = db.create(TYPE_BUCKET_JOB, std::mem::size_of::<BucketJob>(), 0)?;
    *lease.get_mut::<BucketJob>() = job;
    Ok(tag)
}

pub fn job_info(db: &Database, job: Tag) -> Result<BucketJob> {
    let lease = db.access(job)?;
    Ok(*lease.get::<BucketJob>())
}

/// Per-thread sampling scratch, reused across buckets.
#[derive(Default)]
pub struct BucketScratch {
    pixels: Vec<[f32; buffer::CHANNELS]>,
    photon_index: PhotonIndex,
}

fn execute(db: &Database, job_tag: Tag, tls: Tls) -> Result<i32> {
    let job = job_info(db, job_tag)?;
    let (options, camera) = {
        let o = db.access(job.options)?;
        let c = db.access(job.camera)?;
        (*o.get::<Options>(), *c.get::<Camera>())
    };

    let env = crate::env();
    let mut scratch = tls.take_cache::<BucketScratch>();
    let status = render_bucket(db, &env, job_tag, &job, &options, &camera, &mut scratch, tls);
    tls.put_cache(scratch);
    status
}

#[allow(clippy::too_many_arguments)]
fn render_bucket(
    db: &Database,
    env: &EngineEnv,
    job_tag: Tag,
    job: &BucketJob,
    options: &Options,
    camera: &Camera,
    scratch: &mut BucketScratch,
    tls: Tls,
) -> Result<i32> {
    if job.pass == PASS_FINALGATHER_INITIAL {
        return gather_initial(db, job_tag, job, options, camera, scratch, tls);
    }

    let rect = job.rect;
    // Sample positions for the widest allowed pattern; pixels walk the
    // table adaptively and most stop well before the end.
    let max_pattern = options.max_samples.max(1);
    let filter = FilterTable::new(options.filter, options.filter_radius, max_pattern);
    scratch.pixels.clear();
    scratch
        .pixels
        .resize(rect.area() as usize, [0.0; buffer::CHANNELS]);

    for y in rect.top..rect.bottom {
        if tls.aborted() {
            return Ok(JOB_ABORTED);
        }
        for x in rect.left..rect.right {
            let (color, alpha) =
                sample_pixel(db, env, job, options, camera, &filter, x, y, scratch)?;
            let i = ((y - rect.top) * rect.width() + (x - rect.left)) as usize;
            scratch.pixels[i] = [color.r, color.g, color.b, alpha];
        }
    }

    let tile = buffer::store_tile(db, rect, &scratch.pixels)?;
    set_job_output(db, job_tag, tile)?;
    Ok(JOB_OK)
}

/// Adaptive sampling of one pixel. The first sample settles the
/// pixel's quality bounds from the attributes of whatever it hits;
/// sampling then continues until the luminance span drops below the
/// contrast threshold, bounded by the min and max sample counts.
#[allow(clippy::too_many_arguments)]
fn sample_pixel(
    db: &Database,
    env: &EngineEnv,
    job: &BucketJob,
    options: &Options,
    camera: &Camera,
    filter: &FilterTable,
    x: i32,
    y: i32,
    scratch: &mut BucketScratch,
) -> Result<(Color, f32)> {
    let mut accum = PixelAccum::new();
    let mut min_samples = options.min_samples;
    let mut max_samples = options.max_samples;

    let mut index = 0;
    loop {
        let s = filter.get(index);
        let ray = camera_ray(
            camera,
            options,
            x as f32 + 0.5 + s.dx,
            y as f32 + 0.5 + s.dy,
        );
        let (c, a, attrs) = shade_ray(db, env, job, &ray, scratch)?;
        if index == 0 {
            if let Some(attrs) = attrs {
                min_samples = attrs.min_samples;
                max_samples = attrs.max_samples;
            }
        }
        accum.add(s, c, a);

        index += 1;
        let limit = max_samples.clamp(1, filter.len() as i32) as usize;
        if index >= limit || accum.converged(min_samples, options.contrast) {
            break;
        }
    }

    Ok(accum.resolve())
}

fn camera_ray(camera: &Camera, options: &Options, sx: f32, sy: f32) -> Ray {
    let fx = (sx / options.res_x as f32 * 2.0 - 1.0) * camera.aperture * 0.5;
    let fy = (1.0 - sy / options.res_y as f32 * 2.0) * camera.aperture * 0.5 / camera.aspect;
    let dir = camera
        .cam_to_world
        .transform_vector(Vec3::new(fx, fy, -camera.focal).normalized());
    Ray {
        origin: camera.cam_to_world.transform_point(Vec3::default()),
        dir: dir.normalized(),
        t_min: camera.clip_near,
        t_max: camera.clip_far,
    }
}

fn shade_ray(
    db: &Database,
    env: &EngineEnv,
    job: &BucketJob,
    ray: &Ray,
    scratch: &mut BucketScratch,
) -> Result<(Color, f32, Option<Attributes>)> {
    let Some(hit) = trace::trace(db, job.tessels, ray)? else {
        return Ok((Color::default(), 0.0, None));
    };

    let mut state = ShadeState {
        position: hit.position,
        normal: hit.normal,
        incident: ray.dir,
        u: hit.u,
        v: hit.v,
        distance: hit.t,
        lights: job.lights,
        scene: job.tessels,
        photon_map: job.photon_map,
        depth: 0,
        raster_x: 0.0,
        raster_y: 0.0,
    };

    let mut out = ShadeResult::default();
    if hit.material != NULL_TAG {
        out = env
            .nodes
            .call_shader_list(db, &env.shaders, &mut state, hit.material)?;
    }

    // Indirect terms on top of the shader's direct lighting.
    if job.photon_map != NULL_TAG {
        let indirect = scratch.photon_index.radiance_estimate(
            db,
            job.photon_map,
            hit.position,
            hit.normal,
            GATHER_RADIUS,
        )?;
        out.color += indirect * std::f32::consts::FRAC_1_PI;
    }
    if job.pass == PASS_FINALGATHER_REFINE && job.irrad_cache != NULL_TAG {
        let irr = interpolate_irradiance(db, job.irrad_cache, hit.position, hit.normal)?;
        out.color += irr * std::f32::consts::FRAC_1_PI;
    }

    Ok((
        out.color,
        out.opacity.max_component().min(1.0),
        Some(hit.attrs),
    ))
}

// ---- final gather ---------------------------------------------------

const IRRAD_HEAD: usize = std::mem::size_of::<IrradCacheHead>();
const IRRAD_SAMPLE: usize = std::mem::size_of::<IrradSample>();

pub fn create_irrad_cache(db: &Database) -> Result<Tag> {
    let (tag, lease) = db.create(TYPE_IRRAD_CACHE, IRRAD_HEAD, 0)?;
    *lease.get_mut::<IrradCacheHead>() = IrradCacheHead::default();
    drop(lease);
    Ok(tag)
}

pub fn irrad_count(db: &Database, cache: Tag) -> Result<usize> {
    let lease = db.access(cache)?;
    Ok(lease.get::<IrradCacheHead>().count as usize)
}

fn store_irrad_batch(db: &Database, samples: &[IrradSample]) -> Result<Tag> {
    let (tag, lease) = db.create(TYPE_IRRAD_CACHE, IRRAD_HEAD + samples.len() * IRRAD_SAMPLE, 0)?;
    lease.get_mut::<IrradCacheHead>().count = samples.len() as i32;
    for (i, s) in samples.iter().enumerate() {
        *lease.get_at_mut::<IrradSample>(IRRAD_HEAD + i * IRRAD_SAMPLE) = *s;
    }
    drop(lease);
    db.dirt(tag)?;
    Ok(tag)
}

/// Appends a final-gather batch into the cache and deletes the batch.
pub fn merge_irrad_batch(db: &Database, cache: Tag, batch: Tag) -> Result<usize> {
    let samples: Vec<IrradSample> = {
        let lease = db.access(batch)?;
        let count = lease.get::<IrradCacheHead>().count as usize;
        (0..count)
            .map(|i| *lease.get_at::<IrradSample>(IRRAD_HEAD + i * IRRAD_SAMPLE))
            .collect()
    };

    let lease = db.access(cache)?;
    let old = lease.get::<IrradCacheHead>().count as usize;
    let lease = lease.resize(IRRAD_HEAD + (old + samples.len()) * IRRAD_SAMPLE)?;
    for (i, s) in samples.iter().enumerate() {
        *lease.get_at_mut::<IrradSample>(IRRAD_HEAD + (old + i) * IRRAD_SAMPLE) = *s;
    }
    lease.get_mut::<IrradCacheHead>().count = (old + samples.len()) as i32;
    drop(lease);
    db.dirt(cache)?;

    db.delete(batch)?;
    Ok(samples.len())
}

/// Initial pass: irradiance probes on a coarse pixel grid.
#[allow(clippy::too_many_arguments)]
fn gather_initial(
    db: &Database,
    job_tag: Tag,
    job: &BucketJob,
    options: &Options,
    camera: &Camera,
    scratch: &mut BucketScratch,
    tls: Tls,
) -> Result<i32> {
    let rect = job.rect;
    let mut samples: Vec<IrradSample> = vec![];

    let mut y = rect.top;
    while y < rect.bottom {
        if tls.aborted() {
            return Ok(JOB_ABORTED);
        }
        let mut x = rect.left;
        while x < rect.right {
            let ray = camera_ray(camera, options, x as f32 + 0.5, y as f32 + 0.5);
            if let Some(hit) = trace::trace(db, job.tessels, &ray)? {
                let irr = gather_hemisphere(db, job, options, hit.position, hit.normal, scratch)?;
                samples.push(IrradSample {
                    position: hit.position,
                    normal: hit.normal,
                    irradiance: irr,
                });
            }
            x += FG_GRID;
        }
        y += FG_GRID;
    }

    let batch = store_irrad_batch(db, &samples)?;
    set_job_output(db, job_tag, batch)?;
    Ok(JOB_OK)
}

fn set_job_output(db: &Database, job_tag: Tag, output: Tag) -> Result<()> {
    let lease = db.access(job_tag)?;
    lease.get_mut::<BucketJob>().output = output;
    drop(lease);
    db.dirt(job_tag)
}

fn gather_hemisphere(
    db: &Database,
    job: &BucketJob,
    options: &Options,
    position: Vec3,
    normal: Vec3,
    scratch: &mut BucketScratch,
) -> Result<Color> {
    let rays = options.fg_rays.max(1) as u32;
    let mut sum = Color::default();
    for i in 0..rays {
        let (u, v) = qmc::halton_2d(i + 1);
        let dir = qmc::cosine_hemisphere(u, v, normal);
        let ray = Ray {
            origin: position,
            dir,
            t_min: 1e-3,
            t_max: 1e30,
        };
        if let Some(hit) = trace::trace(db, job.tessels, &ray)? {
            // Radiance leaving the secondary hit, from the photon map.
            let r = scratch.photon_index.radiance_estimate(
                db,
                job.photon_map,
                hit.position,
                hit.normal,
                GATHER_RADIUS,
            )?;
            sum += r;
        }
    }
    Ok(sum * (std::f32::consts::PI / rays as f32))
}

/// Nearest-sample irradiance interpolation.
fn interpolate_irradiance(db: &Database, cache: Tag, position: Vec3, normal: Vec3) -> Result<Color> {
    let lease = db.access(cache)?;
    let count = lease.get::<IrradCacheHead>().count as usize;

    let mut weight_sum = 0.0f32;
    let mut irr = Color::default();
    for i in 0..count {
        let s = lease.get_at::<IrradSample>(IRRAD_HEAD + i * IRRAD_SAMPLE);
        let d2 = (s.position - position).length_squared();
        let align = s.normal.dot(normal).max(0.0);
        let w = align / (d2 + 1e-3);
        irr += s.irradiance * w;
        weight_sum += w;
    }
    if weight_sum > 0.0 {
        irr = irr * (1.0 / weight_sum);
    }
    Ok(irr)
}

fn byteswap_job(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, std::mem::size_of::<BucketJob>() / 4);
}

pub fn register(db: &Database) {
    db.register_type(TYPE_BUCKET_JOB, TypeOps {
        name: "bucket_job",
        atomic_size: 0,
        byteswap: Some(byteswap_job),
        generate: None,
        execute: Some(execute),
    });
}
