// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Photon jobs: emit light flux into the scene and deposit the hits in
//! a photon map. Each job fills a batch record of its own; the manager
//! folds batches into the target map between phases. Lookup goes
//! through a balanced-tree grid index built once per map per thread.

use helios_data::geom::{Color, Vec3};
use helios_data::{swap, Tag, NULL_TAG};
use helios_runtime::collections::avl::AvlTree;
use helios_runtime::db::{array, Database, DbValue, TypeOps};
use helios_runtime::error::Result;
use helios_runtime::scheduler::{JOB_ABORTED, JOB_OK};
use helios_runtime::tls::Tls;

use crate::qmc;
use crate::trace::{self, Ray};
use crate::types::{LightInst, Photon, PhotonMapHead, TYPE_PHOTON_JOB, TYPE_PHOTON_MAP};

const ABORT_BATCH: u32 = 1024;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PhotonJob {
    pub lights: Tag,
    pub tessels: Tag,
    /// Caustic or globillum; stored in the batch header.
    pub kind: u32,
    /// Photons to emit.
    pub count: u32,
    /// Start offset into the Halton sequence, so jobs do not repeat
    /// each other's paths.
    pub halton_offset: u32,
    /// Deposit ceiling; reaching it truncates, not fails.
    pub max_photons: u32,
    /// Batch record produced by the executor.
    pub output: Tag,
    pub _pad: u32,
}
unsafe impl DbValue for PhotonJob {}

pub fn create_job(db: &Database, job: PhotonJob) -> Result<Tag> {
    let (tag, lease) = db.create(TYPE_PHOTON_JOB, std::mem::size_of::<PhotonJob>(), 0)?;
    *lease.get_mut::<PhotonJob>() = job;
    Ok(tag)
}

pub fn job_output(db: &Database, job: Tag) -> Result<Tag> {
    let lease = db.access(job)?;
    Ok(lease.get::<PhotonJob>().output)
}

const MAP_HEAD: usize = std::mem::size_of::<PhotonMapHead>();
const PHOTON: usize = std::mem::size_of::<Photon>();

/// Creates an empty photon map record.
pub fn create_map(db: &Database, kind: u32) -> Result<Tag> {
    let (tag, lease) = db.create(TYPE_PHOTON_MAP, MAP_HEAD, 0)?;
    *lease.get_mut::<PhotonMapHead>() = PhotonMapHead {
        count: 0,
        kind,
        _pad: [0; 2],
    };
    Ok(tag)
}

pub fn map_count(db: &Database, map: Tag) -> Result<usize> {
    let lease = db.access(map)?;
    Ok(lease.get::<PhotonMapHead>().count as usize)
}

fn store_batch(db: &Database, kind: u32, photons: &[Photon]) -> Result<Tag> {
    let (tag, lease) = db.create(TYPE_PHOTON_MAP, MAP_HEAD + photons.len() * PHOTON, 0)?;
    *lease.get_mut::<PhotonMapHead>() = PhotonMapHead {
        count: photons.len() as i32,
        kind,
        _pad: [0; 2],
    };
    for (i, p) in photons.iter().enumerate() {
        *lease.get_at_mut::<Photon>(MAP_HEAD + i * PHOTON) = *p;
    }
    drop(lease);
    db.dirt(tag)?;
    Ok(tag)
}

/// Appends a finished batch into the target map and deletes the batch.
pub fn merge_batch(db: &Database, map: Tag, batch: Tag) -> Result<usize> {
    let photons = read_photons(db, batch)?;

    let lease = db.access(map)?;
    let old = lease.get::<PhotonMapHead>().count as usize;
    let lease = lease.resize(MAP_HEAD + (old + photons.len()) * PHOTON)?;
    for (i, p) in photons.iter().enumerate() {
        *lease.get_at_mut::<Photon>(MAP_HEAD + (old + i) * PHOTON) = *p;
    }
    lease.get_mut::<PhotonMapHead>().count = (old + photons.len()) as i32;
    drop(lease);
    db.dirt(map)?;

    db.delete(batch)?;
    Ok(photons.len())
}

fn read_photons(db: &Database, map: Tag) -> Result<Vec<Photon>> {
    let lease = db.access(map)?;
    let count = lease.get::<PhotonMapHead>().count as usize;
    Ok((0..count)
        .map(|i| *lease.get_at::<Photon>(MAP_HEAD + i * PHOTON))
        .collect())
}

fn execute(db: &Database, job_tag: Tag, tls: Tls) -> Result<i32> {
    let job = {
        let lease = db.access(job_tag)?;
        *lease.get::<PhotonJob>()
    };

    // Flux histogram for light importance sampling.
    let lights: Vec<LightInst> = {
        let count = array::size(db, job.lights)?;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let tag: Tag = array::get(db, job.lights, i)?;
            let lease = db.access(tag)?;
            out.push(*lease.get::<LightInst>());
        }
        out
    };
    if lights.is_empty() {
        return Ok(JOB_OK);
    }
    let total_flux: f32 = lights.iter().map(|l| l.flux).sum();

    let mut deposited: Vec<Photon> = vec![];
    let mut truncated = false;

    for i in 0..job.count {
        if i % ABORT_BATCH == 0 && tls.aborted() {
            return Ok(JOB_ABORTED);
        }
        if deposited.len() as u32 >= job.max_photons {
            truncated = true;
            break;
        }

        // Select a light proportional to flux.
        let pick = tls.next_f32() * total_flux;
        let mut acc = 0.0;
        let mut light = &lights[0];
        for l in &lights {
            acc += l.flux;
            if pick <= acc {
                light = l;
                break;
            }
        }

        let (u, v) = qmc::halton_2d(job.halton_offset + i + 1);
        let dir = qmc::sphere_sample(u, v);
        let ray = Ray {
            origin: light.origin,
            dir,
            t_min: 1e-4,
            t_max: 1e30,
        };
        if let Some(hit) = trace::trace(db, job.tessels, &ray)? {
            let scale = 4.0 * std::f32::consts::PI / job.count as f32;
            deposited.push(Photon {
                position: hit.position,
                direction: dir,
                power: light.energy * scale,
            });
        }
    }

    if truncated {
        tracing::warn!(
            achieved = deposited.len(),
            requested = job.count,
            "photon map truncated"
        );
    }

    let batch = store_batch(db, job.kind, &deposited)?;
    let lease = db.access(job_tag)?;
    lease.get_mut::<PhotonJob>().output = batch;
    drop(lease);
    db.dirt(job_tag)?;
    Ok(JOB_OK)
}

// ---- lookup ---------------------------------------------------------

const GRID_CELL: f32 = 0.5;

/// Balanced-tree grid index over one photon map, rebuilt per thread
/// when the map changes.
#[derive(Default)]
pub struct PhotonIndex {
    map: Tag,
    count: usize,
    photons: Vec<Photon>,
    cells: AvlTree<(i32, i32, i32), Vec<u32>>,
}

impl PhotonIndex {
    fn cell_of(p: Vec3) -> (i32, i32, i32) {
        (
            (p.x / GRID_CELL).floor() as i32,
            (p.y / GRID_CELL).floor() as i32,
            (p.z / GRID_CELL).floor() as i32,
        )
    }

    fn rebuild(&mut self, db: &Database, map: Tag) -> Result<()> {
        self.photons = read_photons(db, map)?;
        self.cells.clear();
        for (i, p) in self.photons.iter().enumerate() {
            let key = Self::cell_of(p.position);
            match self.cells.get_mut(&key) {
                Some(bucket) => bucket.push(i as u32),
                None => {
                    self.cells.insert(key, vec![i as u32]);
                }
            }
        }
        self.map = map;
        self.count = self.photons.len();
        Ok(())
    }

    /// Density estimate of the photon power around a point.
    pub fn radiance_estimate(
        &mut self,
        db: &Database,
        map: Tag,
        position: Vec3,
        normal: Vec3,
        radius: f32,
    ) -> Result<Color> {
        if map == NULL_TAG {
            return Ok(Color::default());
        }
        if self.map != map || self.count != map_count(db, map)? {
            self.rebuild(db, map)?;
        }

        let r2 = radius * radius;
        let mut power = Color::default();
        let center = Self::cell_of(position);
        let reach = (radius / GRID_CELL).ceil() as i32;

        for dx in -reach..=reach {
            for dy in -reach..=reach {
                for dz in -reach..=reach {
                    let key = (center.0 + dx, center.1 + dy, center.2 + dz);
                    let Some(bucket) = self.cells.get(&key) else {
                        continue;
                    };
                    for &i in bucket {
                        let p = &self.photons[i as usize];
                        let d = p.position - position;
                        if d.length_squared() <= r2 && normal.dot(p.direction) < 0.0 {
                            power += p.power;
                        }
                    }
                }
            }
        }

        Ok(power * (1.0 / (std::f32::consts::PI * r2)))
    }
}

fn byteswap_job(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, std::mem::size_of::<PhotonJob>() / 4);
}

pub fn register(db: &Database) {
    db.register_type(TYPE_PHOTON_JOB, TypeOps {
        name: "photon_job",
        atomic_size: 0,
        byteswap: Some(byteswap_job),
        generate: None,
        execute: Some(execute),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{self, PHOTON_GLOBILLUM};
    use helios_runtime::db::builtin;
    use helios_runtime::scheduler::{Process, Scheduler, SilentEvents};
    use std::sync::Arc;

    fn scene(db: &Database) -> (Tag, Tag) {
        // A large floor under a bright light.
        let positions = array::create(db, builtin::TYPE_VECTOR).unwrap();
        for v in [
            Vec3::new(-50.0, -50.0, 0.0),
            Vec3::new(50.0, -50.0, 0.0),
            Vec3::new(0.0, 50.0, 0.0),
        ] {
            array::push(db, positions, v).unwrap();
        }
        let (tessel, lease) = db
            .create(types::TYPE_TESSEL, std::mem::size_of::<types::Tessel>(), 0)
            .unwrap();
        *lease.get_mut::<types::Tessel>() = types::Tessel {
            positions,
            tri_count: 1,
            material: NULL_TAG,
            attrs: types::Attributes::unset(),
        };
        drop(lease);
        let tessels = array::create(db, builtin::TYPE_TAG).unwrap();
        array::push(db, tessels, tessel).unwrap();

        let (light, lease) = db
            .create(
                types::TYPE_LIGHT_INST,
                std::mem::size_of::<LightInst>(),
                0,
            )
            .unwrap();
        *lease.get_mut::<LightInst>() = LightInst {
            origin: Vec3::new(0.0, 0.0, 5.0),
            _pad0: 0.0,
            energy: Color::gray(10.0),
            flux: 10.0,
        };
        drop(lease);
        let lights = array::create(db, builtin::TYPE_TAG).unwrap();
        array::push(db, lights, light).unwrap();

        (lights, tessels)
    }

    fn run_photon_job(db: &Arc<Database>, job: PhotonJob) -> Tag {
        let job_tag = create_job(db, job).unwrap();
        let scheduler = Scheduler::new(2);
        let process = Process::new(1, Box::new(SilentEvents));
        scheduler.execute(db, vec![job_tag], &process).unwrap();
        assert_eq!(process.failed_jobs(), 0);
        job_output(db, job_tag).unwrap()
    }

    #[test]
    fn test_emission_and_merge() {
        let db = Arc::new(Database::new(0));
        crate::register_types(&db);
        let (lights, tessels) = scene(&db);

        let batch = run_photon_job(&db, PhotonJob {
            lights,
            tessels,
            kind: PHOTON_GLOBILLUM,
            count: 2048,
            halton_offset: 0,
            max_photons: 100_000,
            output: NULL_TAG,
            _pad: 0,
        });

        // Roughly half the sphere faces the floor.
        let deposited = map_count(&db, batch).unwrap();
        assert!(deposited > 400, "only {deposited} photons deposited");

        let map = create_map(&db, PHOTON_GLOBILLUM).unwrap();
        let merged = merge_batch(&db, map, batch).unwrap();
        assert_eq!(merged, deposited);
        assert_eq!(map_count(&db, map).unwrap(), deposited);
    }

    #[test]
    fn test_truncation_is_not_fatal() {
        let db = Arc::new(Database::new(0));
        crate::register_types(&db);
        let (lights, tessels) = scene(&db);

        let batch = run_photon_job(&db, PhotonJob {
            lights,
            tessels,
            kind: PHOTON_GLOBILLUM,
            count: 10_000,
            halton_offset: 0,
            max_photons: 64,
            output: NULL_TAG,
            _pad: 0,
        });
        assert_eq!(map_count(&db, batch).unwrap(), 64);
    }

    #[test]
    fn test_radiance_estimate_sees_photons() {
        let db = Arc::new(Database::new(0));
        crate::register_types(&db);
        let (lights, tessels) = scene(&db);

        let batch = run_photon_job(&db, PhotonJob {
            lights,
            tessels,
            kind: PHOTON_GLOBILLUM,
            count: 4096,
            halton_offset: 7,
            max_photons: 100_000,
            output: NULL_TAG,
            _pad: 0,
        });
        let map = create_map(&db, PHOTON_GLOBILLUM).unwrap();
        merge_batch(&db, map, batch).unwrap();

        let mut index = PhotonIndex::default();
        let near = index
            .radiance_estimate(&db, map, Vec3::new(0.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0), 2.0)
            .unwrap();
        assert!(near.luminance() > 0.0);

        let far = index
            .radiance_estimate(
                &db,
                map,
                Vec3::new(500.0, 500.0, 500.0),
                Vec3::new(0.0, 0.0, 1.0),
                2.0,
            )
            .unwrap();
        assert_eq!(far.luminance(), 0.0);
    }
}
