// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Render orchestration: compile the scene, run the tessellation,
//! photon and bucket phases over the scheduler (and the farm when one
//! is configured), merge results, and hand the buffers to the output
//! driver.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use helios_data::geom::Rect;
use helios_data::{Tag, NULL_TAG};
use helios_runtime::db::{array, builtin, Database};
use helios_runtime::error::{Error, Result};
use helios_runtime::scheduler::{Process, ProcessEvents, Scheduler, JOB_OK};
use helios_runtime::transport::manager::RemoteFarm;
use helios_runtime::Config;

use crate::bucket::{self, BucketJob};
use crate::buffer;
use crate::connection::{Connection, ConsoleConnection, Severity};
use crate::output::OutputDriver;
use crate::photon::{self, PhotonJob};
use crate::scene::{self, SceneCtx};
use crate::tessellate;
use crate::types::{
    Camera, Options, SceneView, PASS_FINALGATHER_INITIAL, PASS_FINALGATHER_REFINE, PASS_FRAME,
    PHOTON_CAUSTIC, PHOTON_GLOBILLUM, TYPE_CAMERA, TYPE_OPTIONS,
};

/// The manager-side renderer: scene context plus execution resources.
pub struct Renderer {
    ctx: SceneCtx,
    config: Config,
    scheduler: Arc<Scheduler>,
    connection: Arc<dyn Connection>,
    scene_root: Tag,
}

impl Renderer {
    pub fn new(config: Config) -> Result<Renderer> {
        let db = Arc::new(Database::new(config.memlimit_bytes()));
        crate::register_types(&db);
        let ctx = SceneCtx::new(db)?;
        let scheduler = Arc::new(Scheduler::new(config.num_threads()));

        Ok(Renderer {
            ctx,
            config,
            scheduler,
            connection: Arc::new(ConsoleConnection),
            scene_root: NULL_TAG,
        })
    }

    pub fn scene(&self) -> &SceneCtx {
        &self.ctx
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.ctx.db
    }

    pub fn set_connection(&mut self, connection: Arc<dyn Connection>) {
        self.connection = connection;
    }

    /// Installs the root instance group to render.
    pub fn set_scene(&mut self, root_group: Tag) {
        self.scene_root = root_group;
    }

    /// Renders one frame through the given options and camera instance
    /// nodes. On a user abort the partial image is still written.
    pub fn render(
        &mut self,
        options_node: Tag,
        camera_instance: Tag,
        output: &dyn OutputDriver,
    ) -> Result<()> {
        if self.scene_root == NULL_TAG {
            return Err(Error::UnknownTag(NULL_TAG));
        }
        let db = self.ctx.db.clone();
        let started = Instant::now();

        let (options_rec, options) = self.compile_options(options_node)?;
        let (camera_rec, _camera) = self.compile_camera(camera_instance)?;

        let mut farm = self.connect_farm()?;

        // Tessellation phase.
        let t = Instant::now();
        let compiled = scene::compile(&self.ctx, self.scene_root, &options)?;
        let mut view = SceneView {
            options: options_rec,
            camera: camera_rec,
            lights: compiled.lights,
            tessels: array::create(&db, builtin::TYPE_TAG)?,
            ..Default::default()
        };
        self.run_phase(&mut farm, compiled.tessel_jobs.clone(), Phase::Tessellate)?;
        for job in &compiled.tessel_jobs {
            let tessel = tessellate::job_output(&db, *job)?;
            if tessel != NULL_TAG {
                array::push(&db, view.tessels, tessel)?;
            }
        }
        info!(elapsed = ?t.elapsed(), "tessellation done");

        // Photon phase.
        if options.caustic_photons > 0 || options.globillum_photons > 0 {
            let t = Instant::now();
            self.photon_phase(&mut farm, &mut view, &options)?;
            info!(elapsed = ?t.elapsed(), "photon maps done");
        }

        // Final gather initial pass.
        if options.finalgather != 0 {
            let t = Instant::now();
            view.irrad_cache = bucket::create_irrad_cache(&db)?;
            let jobs = self.bucket_jobs(&view, &options, PASS_FINALGATHER_INITIAL)?;
            self.run_phase(&mut farm, jobs.clone(), Phase::GatherInitial {
                cache: view.irrad_cache,
            })?;
            for job in jobs {
                db.delete(job).ok();
            }
            info!(
                samples = bucket::irrad_count(&db, view.irrad_cache)?,
                elapsed = ?t.elapsed(),
                "final gather cache built"
            );
        }

        // Frame pass.
        let t = Instant::now();
        let color_fb = buffer::create_framebuffer(&db, options.res_x, options.res_y)?;
        let opacity_fb = buffer::create_framebuffer(&db, options.res_x, options.res_y)?;
        let pass = if options.finalgather != 0 {
            PASS_FINALGATHER_REFINE
        } else {
            PASS_FRAME
        };
        let jobs = self.bucket_jobs(&view, &options, pass)?;
        let frame_result = self.run_phase(&mut farm, jobs.clone(), Phase::Frame {
            color_fb,
            opacity_fb,
        });
        for job in jobs {
            db.delete(job).ok();
        }
        info!(elapsed = ?t.elapsed(), "frame pass done");

        if let Some(mut farm) = farm {
            farm.end_scene().ok();
            farm.disconnect().ok();
        }

        // A partial image is still an image.
        output.write(&db, color_fb, opacity_fb, options_rec, camera_rec)?;

        // Compiled representations live only for this frame; the node
        // graph stays for the next scene update.
        self.release_scene_data(&view, &compiled.tessel_jobs);
        for fb in [color_fb, opacity_fb] {
            self.ctx.db.delete(fb).ok();
        }

        match frame_result {
            Err(Error::Aborted) => {
                self.connection
                    .print(Severity::Info, "render aborted by application");
                Err(Error::Aborted)
            }
            other => {
                if other.is_ok() {
                    info!(elapsed = ?started.elapsed(), "render finished");
                }
                other
            }
        }
    }

    /// Drops every record the compile and render phases produced.
    fn release_scene_data(&self, view: &SceneView, tessel_jobs: &[Tag]) {
        let db = &self.ctx.db;

        for job in tessel_jobs {
            if let Ok(tessel) = tessellate::job_output(db, *job) {
                if tessel != NULL_TAG {
                    if let Ok(lease) = db.access(tessel) {
                        let positions = lease.get::<crate::types::Tessel>().positions;
                        drop(lease);
                        db.delete(positions).ok();
                    }
                    db.delete(tessel).ok();
                }
            }
            db.delete(*job).ok();
        }

        if let Ok(count) = array::size(db, view.lights) {
            for i in 0..count {
                if let Ok(light) = array::get::<Tag>(db, view.lights, i) {
                    db.delete(light).ok();
                }
            }
        }

        for tag in [
            view.lights,
            view.tessels,
            view.caustic_map,
            view.globillum_map,
            view.irrad_cache,
            view.options,
            view.camera,
        ] {
            if tag != NULL_TAG {
                db.delete(tag).ok();
            }
        }
    }

    fn connect_farm(&self) -> Result<Option<RemoteFarm>> {
        if !self.config.distributed || self.config.servers.is_empty() {
            return Ok(None);
        }
        let farm = RemoteFarm::connect(&self.config, self.config.num_threads() as u32)?;
        if farm.host_count() == 0 {
            warn!("no render servers reachable; rendering locally");
            return Ok(None);
        }
        Ok(Some(farm))
    }

    /// Runs one job batch locally and on the farm.
    fn run_phase(
        &self,
        farm: &mut Option<RemoteFarm>,
        jobs: Vec<Tag>,
        phase: Phase,
    ) -> Result<()> {
        let db = &self.ctx.db;
        let process = Process::new(
            jobs.len(),
            Box::new(RenderEvents {
                db: db.clone(),
                connection: self.connection.clone(),
                phase,
                merge: Mutex::new(()),
            }),
        );

        if let Some(farm) = farm.as_mut() {
            farm.sync_headers(db)?;
            farm.begin_phase(db, &self.scheduler);
        }
        let result = self.scheduler.execute(db, jobs, &process);
        if let Some(farm) = farm.as_mut() {
            farm.end_phase();
        }
        result
    }

    fn photon_phase(
        &self,
        farm: &mut Option<RemoteFarm>,
        view: &mut SceneView,
        options: &Options,
    ) -> Result<()> {
        let db = &self.ctx.db;
        let workers = self.scheduler.nthreads().max(1)
            + farm.as_ref().map(|f| f.host_count()).unwrap_or(0);

        let mut jobs = vec![];
        for (kind, total, map_slot) in [
            (PHOTON_CAUSTIC, options.caustic_photons, &mut view.caustic_map),
            (
                PHOTON_GLOBILLUM,
                options.globillum_photons,
                &mut view.globillum_map,
            ),
        ] {
            if total <= 0 {
                continue;
            }
            let map = photon::create_map(db, kind)?;
            *map_slot = map;

            let per_job = (total as u32).div_ceil(workers as u32);
            let mut offset = 0u32;
            while offset < total as u32 {
                let count = per_job.min(total as u32 - offset);
                jobs.push((
                    map,
                    photon::create_job(db, PhotonJob {
                        lights: view.lights,
                        tessels: view.tessels,
                        kind,
                        count,
                        halton_offset: offset,
                        max_photons: options.max_photons as u32,
                        output: NULL_TAG,
                        _pad: 0,
                    })?,
                ));
                offset += count;
            }
        }

        let map_of: std::collections::HashMap<Tag, Tag> =
            jobs.iter().map(|(map, job)| (*job, *map)).collect();
        let job_tags: Vec<Tag> = jobs.iter().map(|(_, job)| *job).collect();
        self.run_phase(farm, job_tags.clone(), Phase::Photon { map_of })?;
        for job in job_tags {
            db.delete(job).ok();
        }
        Ok(())
    }

    fn bucket_jobs(&self, view: &SceneView, options: &Options, pass: u32) -> Result<Vec<Tag>> {
        let db = &self.ctx.db;
        let size = options.bucket_size.max(1);
        let photon_map = if view.globillum_map != NULL_TAG {
            view.globillum_map
        } else {
            view.caustic_map
        };
        let mut jobs = vec![];

        let mut y = 0;
        while y < options.res_y {
            let mut x = 0;
            while x < options.res_x {
                let rect = Rect::new(
                    x,
                    (x + size).min(options.res_x),
                    y,
                    (y + size).min(options.res_y),
                );
                jobs.push(bucket::create_job(db, BucketJob {
                    rect,
                    pass,
                    _pad: 0,
                    options: view.options,
                    camera: view.camera,
                    lights: view.lights,
                    tessels: view.tessels,
                    photon_map,
                    irrad_cache: view.irrad_cache,
                    output: NULL_TAG,
                    _pad2: 0,
                })?);
                x += size;
            }
            y += size;
        }
        Ok(jobs)
    }

    fn compile_options(&self, node: Tag) -> Result<(Tag, Options)> {
        let g = |name: &str| self.ctx.get(node, name);
        let options = Options {
            res_x: g("res_x")?.as_int().unwrap_or(640),
            res_y: g("res_y")?.as_int().unwrap_or(480),
            bucket_size: g("bucket_size")?.as_int().unwrap_or(48),
            min_samples: g("min_samples")?.as_int().unwrap_or(1),
            max_samples: g("max_samples")?.as_int().unwrap_or(4),
            filter: g("filter")?.as_int().unwrap_or(0),
            filter_radius: g("filter_radius")?.as_scalar().unwrap_or(0.0),
            contrast: g("contrast")?.as_scalar().unwrap_or(0.05),
            caustic_photons: g("caustic_photons")?.as_int().unwrap_or(0),
            globillum_photons: g("globillum_photons")?.as_int().unwrap_or(0),
            max_photons: g("max_photons")?.as_int().unwrap_or(100_000),
            finalgather: g("finalgather")?.as_int().unwrap_or(0),
            fg_rays: g("fg_rays")?.as_int().unwrap_or(16),
        };

        let (tag, lease) = self
            .ctx
            .db
            .create(TYPE_OPTIONS, std::mem::size_of::<Options>(), 0)?;
        *lease.get_mut::<Options>() = options;
        Ok((tag, options))
    }

    fn compile_camera(&self, camera_instance: Tag) -> Result<(Tag, Camera)> {
        let element = self
            .ctx
            .get(camera_instance, "element")?
            .as_tag()
            .filter(|t| *t != NULL_TAG)
            .ok_or(Error::UnknownTag(camera_instance))?;
        let xform = scene::matrix_param(&self.ctx.db, &self.ctx.env, camera_instance, "transform")?;

        let g = |name: &str| self.ctx.get(element, name);
        let camera = Camera {
            focal: g("focal")?.as_scalar().unwrap_or(1.0),
            aperture: g("aperture")?.as_scalar().unwrap_or(2.0),
            aspect: g("aspect")?.as_scalar().unwrap_or(1.0),
            clip_near: g("clip_near")?.as_scalar().unwrap_or(1e-4),
            clip_far: g("clip_far")?.as_scalar().unwrap_or(1e30),
            _pad: [0.0; 3],
            cam_to_world: xform,
        };

        let (tag, lease) = self
            .ctx
            .db
            .create(TYPE_CAMERA, std::mem::size_of::<Camera>(), 0)?;
        *lease.get_mut::<Camera>() = camera;
        Ok((tag, camera))
    }
}

/// What to do with a finished job of the running phase.
enum Phase {
    Tessellate,
    Photon {
        map_of: std::collections::HashMap<Tag, Tag>,
    },
    GatherInitial {
        cache: Tag,
    },
    Frame {
        color_fb: Tag,
        opacity_fb: Tag,
    },
}

/// Applies job side effects as they complete and relays progress to
/// the application. The merge lock keeps connection callbacks
/// sequential even though workers finish concurrently.
struct RenderEvents {
    db: Arc<Database>,
    connection: Arc<dyn Connection>,
    phase: Phase,
    merge: Mutex<()>,
}

impl ProcessEvents for RenderEvents {
    fn progress(&self, percent: f32) -> bool {
        self.connection.progress(percent)
    }

    fn job_started(&self, job: Tag) {
        if let Phase::Frame { .. } = self.phase {
            let _guard = self.merge.lock().unwrap();
            if let Ok(info) = bucket::job_info(&self.db, job) {
                self.connection.clear_tile(info.rect, self.db.host());
            }
        }
    }

    fn job_finished(&self, job: Tag, result: i32) {
        if result != JOB_OK {
            return;
        }
        let _guard = self.merge.lock().unwrap();
        let merged = match &self.phase {
            Phase::Tessellate => Ok(()),
            Phase::Photon { map_of } => self.merge_photons(job, map_of),
            Phase::GatherInitial { cache } => self.merge_gather(job, *cache),
            Phase::Frame {
                color_fb,
                opacity_fb,
            } => self.merge_frame(job, *color_fb, *opacity_fb),
        };
        if let Err(e) = merged {
            warn!(job, "could not merge job output: {e}");
        }
    }
}

impl RenderEvents {
    fn merge_photons(&self, job: Tag, map_of: &std::collections::HashMap<Tag, Tag>) -> Result<()> {
        let batch = photon::job_output(&self.db, job)?;
        if batch == NULL_TAG {
            return Ok(());
        }
        let map = map_of.get(&job).copied().unwrap_or(NULL_TAG);
        if map != NULL_TAG {
            photon::merge_batch(&self.db, map, batch)?;
        }
        Ok(())
    }

    fn merge_gather(&self, job: Tag, cache: Tag) -> Result<()> {
        let batch = bucket::job_info(&self.db, job)?.output;
        if batch != NULL_TAG {
            bucket::merge_irrad_batch(&self.db, cache, batch)?;
        }
        Ok(())
    }

    fn merge_frame(&self, job: Tag, color_fb: Tag, opacity_fb: Tag) -> Result<()> {
        let info = bucket::job_info(&self.db, job)?;
        if info.output == NULL_TAG {
            return Ok(());
        }
        let rect = buffer::merge_tile_split(&self.db, color_fb, opacity_fb, info.output)?;
        self.connection
            .update_tile(&self.db, color_fb, opacity_fb, rect);
        Ok(())
    }
}
