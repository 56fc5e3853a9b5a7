// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Ray intersection against the compiled tessellations. The shading
//! math beyond the matte model lives in shader plugins; this module
//! only finds hits.

use helios_data::geom::Vec3;
use helios_data::{Tag, NULL_TAG};
use helios_runtime::db::{array, Database};
use helios_runtime::error::Result;

use crate::types::{Attributes, Tessel};

#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub dir: Vec3,
    pub t_min: f32,
    pub t_max: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub t: f32,
    pub position: Vec3,
    pub normal: Vec3,
    pub u: f32,
    pub v: f32,
    /// Shader list of the hit surface.
    pub material: Tag,
    /// Composed attributes of the hit instance.
    pub attrs: Attributes,
}

/// Moeller-Trumbore; returns (t, u, v).
fn intersect_triangle(ray: &Ray, v0: Vec3, v1: Vec3, v2: Vec3) -> Option<(f32, f32, f32)> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = ray.dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-9 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t < ray.t_min || t > ray.t_max {
        return None;
    }
    Some((t, u, v))
}

/// Walks every tessellation and returns the nearest hit.
pub fn trace(db: &Database, tessels: Tag, ray: &Ray) -> Result<Option<Hit>> {
    let mut best: Option<Hit> = None;
    let mut clipped = *ray;

    if tessels == NULL_TAG {
        return Ok(None);
    }

    let count = array::size(db, tessels)?;
    for i in 0..count {
        let tessel_tag: Tag = array::get(db, tessels, i)?;
        let head = {
            let lease = db.access(tessel_tag)?;
            *lease.get::<Tessel>()
        };
        let positions = array::lease::<Vec3>(db, head.positions)?;

        for tri in 0..head.tri_count as usize {
            let v0 = *positions.get(tri * 3);
            let v1 = *positions.get(tri * 3 + 1);
            let v2 = *positions.get(tri * 3 + 2);
            if let Some((t, u, v)) = intersect_triangle(&clipped, v0, v1, v2) {
                let mut normal = (v1 - v0).cross(v2 - v0).normalized();
                if normal.dot(clipped.dir) > 0.0 {
                    normal = normal * -1.0;
                }
                best = Some(Hit {
                    t,
                    position: clipped.origin + clipped.dir * t,
                    normal,
                    u,
                    v,
                    material: head.material,
                    attrs: head.attrs,
                });
                clipped.t_max = t;
            }
        }
    }
    Ok(best)
}

/// Shadow query: anything between origin and the light? Surfaces whose
/// attributes do not cast shadows are skipped.
pub fn occluded(db: &Database, tessels: Tag, origin: Vec3, target: Vec3) -> Result<bool> {
    let delta = target - origin;
    let dist = delta.length();
    if dist <= 1e-6 {
        return Ok(false);
    }
    let mut ray = Ray {
        origin,
        dir: delta * (1.0 / dist),
        t_min: 1e-4,
        t_max: dist - 1e-4,
    };
    loop {
        match trace(db, tessels, &ray)? {
            Some(hit) if !hit.attrs.casts_shadow() => {
                // Keep looking past the non-blocking surface.
                ray.t_min = hit.t + 1e-4;
                if ray.t_min >= ray.t_max {
                    return Ok(false);
                }
            }
            Some(_) => return Ok(true),
            None => return Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;
    use helios_runtime::db::builtin;

    fn scene_with_triangle(db: &Database, v0: Vec3, v1: Vec3, v2: Vec3) -> Tag {
        let positions = array::create(db, builtin::TYPE_VECTOR).unwrap();
        for v in [v0, v1, v2] {
            array::push(db, positions, v).unwrap();
        }
        let (tessel, lease) = db
            .create(types::TYPE_TESSEL, std::mem::size_of::<Tessel>(), 0)
            .unwrap();
        *lease.get_mut::<Tessel>() = Tessel {
            positions,
            tri_count: 1,
            material: NULL_TAG,
            attrs: Attributes::unset(),
        };
        drop(lease);

        let list = array::create(db, builtin::TYPE_TAG).unwrap();
        array::push(db, list, tessel).unwrap();
        list
    }

    fn clear_shadow_flag(db: &Database, list: Tag) {
        let tessel: Tag = array::get(db, list, 0).unwrap();
        let lease = db.access(tessel).unwrap();
        lease.get_mut::<Tessel>().attrs.flags &= !crate::types::ATTR_CAST_SHADOW;
    }

    fn test_db() -> Database {
        let db = Database::new(0);
        builtin::register(&db);
        types::register(&db);
        db
    }

    #[test]
    fn test_hit_and_miss() {
        let db = test_db();
        let list = scene_with_triangle(
            &db,
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        );

        let hit = trace(
            &db,
            list,
            &Ray {
                origin: Vec3::new(0.0, 0.0, 5.0),
                dir: Vec3::new(0.0, 0.0, -1.0),
                t_min: 1e-4,
                t_max: 1e30,
            },
        )
        .unwrap()
        .expect("center ray must hit");
        assert!((hit.t - 5.0).abs() < 1e-4);
        assert!((hit.normal.z - 1.0).abs() < 1e-5);

        let miss = trace(
            &db,
            list,
            &Ray {
                origin: Vec3::new(3.0, 3.0, 5.0),
                dir: Vec3::new(0.0, 0.0, -1.0),
                t_min: 1e-4,
                t_max: 1e30,
            },
        )
        .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_occlusion() {
        let db = test_db();
        let list = scene_with_triangle(
            &db,
            Vec3::new(-5.0, -5.0, 1.0),
            Vec3::new(5.0, -5.0, 1.0),
            Vec3::new(0.0, 5.0, 1.0),
        );

        // Light above the blocker, shading point below it.
        assert!(occluded(
            &db,
            list,
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 5.0)
        )
        .unwrap());
        // Sideways path misses the blocker.
        assert!(!occluded(
            &db,
            list,
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(6.0, 0.0, 0.0)
        )
        .unwrap());
    }

    #[test]
    fn test_shadowless_surfaces_do_not_occlude() {
        let db = test_db();
        let list = scene_with_triangle(
            &db,
            Vec3::new(-5.0, -5.0, 1.0),
            Vec3::new(5.0, -5.0, 1.0),
            Vec3::new(0.0, 5.0, 1.0),
        );
        clear_shadow_flag(&db, list);

        assert!(!occluded(
            &db,
            list,
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 5.0)
        )
        .unwrap());
    }
}
