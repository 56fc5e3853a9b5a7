// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Tessellation jobs: lower one object instance into a world-space
//! triangle soup record. Runs wherever the scheduler puts it; the job
//! record carries the output tag back to the manager.

use helios_data::geom::{Mat4, Vec3};
use helios_data::{swap, Tag, NULL_TAG};
use helios_runtime::db::{array, builtin, Database, DbValue, TypeOps};
use helios_runtime::error::Result;
use helios_runtime::scheduler::JOB_OK;
use helios_runtime::tls::Tls;

use crate::types::{Attributes, Tessel, TYPE_TESSEL, TYPE_TESSEL_JOB};

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TesselJob {
    /// Polyobject node to lower.
    pub object: Tag,
    /// Shader list the tessellation will carry.
    pub material: Tag,
    /// Composed instance attributes to stamp on the output.
    pub attrs: Attributes,
    /// Object-to-world transform.
    pub xform: Mat4,
    /// Resulting tessellation record, filled by the executor.
    pub output: Tag,
}
unsafe impl DbValue for TesselJob {}

pub fn create_job(db: &Database, job: TesselJob) -> Result<Tag> {
    let (tag, lease) = db.create(TYPE_TESSEL_JOB, std::mem::size_of::<TesselJob>(), 0)?;
    *lease.get_mut::<TesselJob>() = job;
    Ok(tag)
}

/// Output tessellation of a finished job.
pub fn job_output(db: &Database, job: Tag) -> Result<Tag> {
    let lease = db.access(job)?;
    Ok(lease.get::<TesselJob>().output)
}

fn execute(db: &Database, job_tag: Tag, tls: Tls) -> Result<i32> {
    let job = {
        let lease = db.access(job_tag)?;
        *lease.get::<TesselJob>()
    };

    let env = crate::env();
    let positions = env
        .nodes
        .get_param(db, job.object, "positions")?
        .as_tag()
        .unwrap_or(NULL_TAG);
    let indices = env
        .nodes
        .get_param(db, job.object, "indices")?
        .as_tag()
        .unwrap_or(NULL_TAG);

    let out_positions = array::create(db, builtin::TYPE_VECTOR)?;
    let mut tri_count = 0i32;
    {
        let pos = array::lease::<Vec3>(db, positions)?;
        let idx = array::lease::<i32>(db, indices)?;
        let face_count = idx.len() / 3;
        array::reserve(db, out_positions, face_count * 3)?;

        for face in 0..face_count {
            if tls.aborted() {
                break;
            }
            for corner in 0..3 {
                let vi = *idx.get(face * 3 + corner) as usize;
                let world = job.xform.transform_point(*pos.get(vi));
                array::push(db, out_positions, world)?;
            }
            tri_count += 1;
        }
    }

    let (tessel, lease) = db.create(TYPE_TESSEL, std::mem::size_of::<Tessel>(), 0)?;
    *lease.get_mut::<Tessel>() = Tessel {
        positions: out_positions,
        tri_count,
        material: job.material,
        attrs: job.attrs,
    };
    drop(lease);
    db.dirt(tessel)?;

    let lease = db.access(job_tag)?;
    lease.get_mut::<TesselJob>().output = tessel;
    drop(lease);
    db.dirt(job_tag)?;
    Ok(JOB_OK)
}

fn byteswap_job(_db: &Database, bytes: &mut [u8]) {
    swap::swap_fields(bytes, 4, std::mem::size_of::<TesselJob>() / 4);
}

pub fn register(db: &Database) {
    db.register_type(TYPE_TESSEL_JOB, TypeOps {
        name: "tessel_job",
        atomic_size: 0,
        byteswap: Some(byteswap_job),
        generate: None,
        execute: Some(execute),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneCtx;
    use helios_runtime::scheduler::{Process, Scheduler, SilentEvents};
    use std::sync::Arc;

    #[test]
    fn test_tessellation_applies_transform() {
        let db = Arc::new(Database::new(0));
        crate::register_types(&db);
        let ctx = SceneCtx::new(db.clone()).unwrap();

        let obj = ctx
            .create_polyobject(
                &[
                    Vec3::new(0.0, 0.0, 0.0),
                    Vec3::new(1.0, 0.0, 0.0),
                    Vec3::new(0.0, 1.0, 0.0),
                    Vec3::new(1.0, 1.0, 0.0),
                ],
                &[0, 1, 2, 2, 1, 3],
            )
            .unwrap();

        let mut attrs = Attributes::unset();
        attrs.min_samples = 2;
        attrs.max_samples = 8;
        let job = create_job(&db, TesselJob {
            object: obj,
            material: NULL_TAG,
            attrs,
            xform: Mat4::translation(Vec3::new(0.0, 0.0, -4.0)),
            output: NULL_TAG,
        })
        .unwrap();

        let scheduler = Scheduler::new(2);
        let process = Process::new(1, Box::new(SilentEvents));
        scheduler.execute(&db, vec![job], &process).unwrap();

        let tessel_tag = job_output(&db, job).unwrap();
        assert_ne!(tessel_tag, NULL_TAG);

        let lease = db.access(tessel_tag).unwrap();
        let tessel = *lease.get::<Tessel>();
        drop(lease);
        assert_eq!(tessel.tri_count, 2);
        assert_eq!(tessel.attrs.min_samples, 2);
        assert_eq!(tessel.attrs.max_samples, 8);

        let pos = array::lease::<Vec3>(&db, tessel.positions).unwrap();
        assert_eq!(pos.len(), 6);
        assert_eq!(*pos.get(0), Vec3::new(0.0, 0.0, -4.0));
        assert_eq!(*pos.get(5), Vec3::new(1.0, 1.0, -4.0));
    }
}
