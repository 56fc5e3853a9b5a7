// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Scene construction and compilation. The exporter builds the scene
//! as nodes (options, camera, instances, objects, lights, materials);
//! compilation walks the instance DAG, binds lights, and emits one
//! tessellation job per visible object instance.

use std::sync::Arc;

use tracing::debug;

use helios_data::geom::{Color, Mat4, Vec3};
use helios_data::{Tag, NULL_TAG};
use helios_runtime::db::{array, builtin, Database};
use helios_runtime::error::{Error, Result};
use helios_runtime::nodesys::{DescBuilder, ParamValue, StorageClass};

use crate::tessellate::{self, TesselJob};
use crate::types::{self, Attributes, LightInst, Options};
use crate::EngineEnv;

use std::collections::HashMap;
use std::sync::Mutex;

/// Scene editing handle: the database, the node system, and the name
/// registry of this scene's descriptors.
pub struct SceneCtx {
    pub db: Arc<Database>,
    pub env: Arc<EngineEnv>,
    descs: Mutex<HashMap<String, Tag>>,
}

impl SceneCtx {
    pub fn new(db: Arc<Database>) -> Result<SceneCtx> {
        let env = crate::init_env();
        let ctx = SceneCtx {
            db,
            env,
            descs: Mutex::new(HashMap::new()),
        };
        ctx.register_descriptors()?;
        Ok(ctx)
    }

    /// Adds a named descriptor to this scene.
    pub fn add_descriptor(&self, name: &str, builder: DescBuilder) -> Result<Tag> {
        let tag = self.env.nodes.register_descriptor(&self.db, builder)?;
        self.descs.lock().unwrap().insert(name.to_owned(), tag);
        Ok(tag)
    }

    /// Built-in scene element descriptors.
    fn register_descriptors(&self) -> Result<()> {
        self.add_descriptor(
            "options",
            DescBuilder::new("options")
                .param(StorageClass::Constant, "res_x", ParamValue::Int(640))
                .param(StorageClass::Constant, "res_y", ParamValue::Int(480))
                .param(StorageClass::Constant, "bucket_size", ParamValue::Int(48))
                .param(StorageClass::Constant, "min_samples", ParamValue::Int(1))
                .param(StorageClass::Constant, "max_samples", ParamValue::Int(4))
                .param(StorageClass::Constant, "filter", ParamValue::Int(types::FILTER_BOX))
                .param(StorageClass::Constant, "filter_radius", ParamValue::Scalar(0.0))
                .param(StorageClass::Constant, "contrast", ParamValue::Scalar(0.05))
                .param(StorageClass::Constant, "caustic_photons", ParamValue::Int(0))
                .param(StorageClass::Constant, "globillum_photons", ParamValue::Int(0))
                .param(StorageClass::Constant, "max_photons", ParamValue::Int(100_000))
                .param(StorageClass::Constant, "finalgather", ParamValue::Int(0))
                .param(StorageClass::Constant, "fg_rays", ParamValue::Int(16)),
        )?;

        self.add_descriptor(
            "camera",
            DescBuilder::new("camera")
                .param(StorageClass::Constant, "focal", ParamValue::Scalar(1.0))
                .param(StorageClass::Constant, "aperture", ParamValue::Scalar(2.0))
                .param(StorageClass::Constant, "aspect", ParamValue::Scalar(1.0))
                .param(StorageClass::Constant, "clip_near", ParamValue::Scalar(1e-4))
                .param(StorageClass::Constant, "clip_far", ParamValue::Scalar(1e30)),
        )?;

        self.add_descriptor(
            "instance",
            DescBuilder::new("instance")
                .param(StorageClass::Constant, "element", ParamValue::Tag(NULL_TAG))
                .param(StorageClass::Constant, "material", ParamValue::Tag(NULL_TAG))
                .param(StorageClass::Constant, "transform", ParamValue::Tag(NULL_TAG))
                .param(StorageClass::Constant, "visible", ParamValue::Int(1))
                .param(StorageClass::Constant, "cast_shadow", ParamValue::Int(1))
                .param(StorageClass::Constant, "min_samples", ParamValue::Int(types::ATTR_INHERIT))
                .param(StorageClass::Constant, "max_samples", ParamValue::Int(types::ATTR_INHERIT)),
        )?;

        self.add_descriptor(
            "instgroup",
            DescBuilder::new("instgroup")
                .param(StorageClass::Constant, "elements", ParamValue::Tag(NULL_TAG)),
        )?;

        self.add_descriptor(
            "polyobject",
            DescBuilder::new("polyobject")
                .param(StorageClass::Vertex, "positions", ParamValue::Tag(NULL_TAG))
                .param(StorageClass::Varying, "indices", ParamValue::Tag(NULL_TAG)),
        )?;

        self.add_descriptor(
            "light",
            DescBuilder::new("light")
                .param(StorageClass::Constant, "origin", ParamValue::Vector(Vec3::default()))
                .param(StorageClass::Constant, "energy", ParamValue::Color(Color::gray(1.0)))
                .param(StorageClass::Constant, "intensity", ParamValue::Scalar(1.0)),
        )?;

        self.add_descriptor(
            "material",
            DescBuilder::new("material")
                .param(StorageClass::Constant, "shaders", ParamValue::Tag(NULL_TAG)),
        )?;

        self.add_descriptor(
            "matte",
            DescBuilder::new("matte")
                .param(StorageClass::Constant, "diffuse", ParamValue::Color(Color::gray(0.8))),
        )?;

        Ok(())
    }

    fn desc(&self, name: &str) -> Result<Tag> {
        self.descs
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| Error::SymbolNotFound(name.to_owned()))
    }

    pub fn create_options(&self) -> Result<Tag> {
        self.env.nodes.create_node(&self.db, self.desc("options")?)
    }

    pub fn create_camera(&self) -> Result<Tag> {
        self.env.nodes.create_node(&self.db, self.desc("camera")?)
    }

    pub fn create_instance(&self, element: Tag) -> Result<Tag> {
        let inst = self.env.nodes.create_node(&self.db, self.desc("instance")?)?;
        self.set(inst, "element", ParamValue::Tag(element))?;
        Ok(inst)
    }

    pub fn create_instgroup(&self) -> Result<Tag> {
        let group = self.env.nodes.create_node(&self.db, self.desc("instgroup")?)?;
        let elements = array::create(&self.db, builtin::TYPE_TAG)?;
        self.set(group, "elements", ParamValue::Tag(elements))?;
        Ok(group)
    }

    /// Triangle mesh object; `indices` holds 3 vertex indices per face.
    pub fn create_polyobject(&self, positions: &[Vec3], indices: &[i32]) -> Result<Tag> {
        assert_eq!(indices.len() % 3, 0);
        let node = self.env.nodes.create_node(&self.db, self.desc("polyobject")?)?;

        let pos = array::create(&self.db, builtin::TYPE_VECTOR)?;
        for p in positions {
            array::push(&self.db, pos, *p)?;
        }
        let idx = array::create(&self.db, builtin::TYPE_INT)?;
        for i in indices {
            array::push(&self.db, idx, *i)?;
        }

        self.set(node, "positions", ParamValue::Tag(pos))?;
        self.set(node, "indices", ParamValue::Tag(idx))?;
        Ok(node)
    }

    pub fn create_light(&self) -> Result<Tag> {
        self.env.nodes.create_node(&self.db, self.desc("light")?)
    }

    pub fn create_material(&self) -> Result<Tag> {
        let node = self.env.nodes.create_node(&self.db, self.desc("material")?)?;
        let shaders = array::create(&self.db, builtin::TYPE_TAG)?;
        self.set(node, "shaders", ParamValue::Tag(shaders))?;
        Ok(node)
    }

    /// Instantiates a shader node; the descriptor carries the shader's
    /// name ("matte" is built in, plugins register their own).
    pub fn create_shader(&self, shader: &str) -> Result<Tag> {
        self.env
            .nodes
            .create_shader_node(&self.db, self.desc(shader)?, shader)
    }

    pub fn set(&self, node: Tag, name: &str, value: ParamValue) -> Result<()> {
        self.env.nodes.set_param(&self.db, node, name, value)
    }

    pub fn get(&self, node: Tag, name: &str) -> Result<ParamValue> {
        self.env.nodes.get_param(&self.db, node, name)
    }

    /// Stores a matrix as a 16-scalar array bound to `name`.
    pub fn set_matrix(&self, node: Tag, name: &str, m: Mat4) -> Result<()> {
        let arr = match self.get(node, name)?.as_tag() {
            Some(t) if t != NULL_TAG => {
                array::clear(&self.db, t)?;
                t
            }
            _ => array::create(&self.db, builtin::TYPE_SCALAR)?,
        };
        for row in &m.m {
            for v in row {
                array::push(&self.db, arr, *v)?;
            }
        }
        self.set(node, name, ParamValue::Tag(arr))
    }

    pub fn add_instance(&self, group: Tag, instance: Tag) -> Result<()> {
        let elements = self
            .get(group, "elements")?
            .as_tag()
            .filter(|t| *t != NULL_TAG)
            .ok_or(Error::UnknownTag(group))?;
        array::push(&self.db, elements, instance)?;
        Ok(())
    }

    pub fn add_shader(&self, material: Tag, shader: Tag) -> Result<()> {
        let shaders = self
            .get(material, "shaders")?
            .as_tag()
            .filter(|t| *t != NULL_TAG)
            .ok_or(Error::UnknownTag(material))?;
        array::push(&self.db, shaders, shader)?;
        Ok(())
    }
}

/// Reads a matrix parameter stored as a 16-scalar array.
pub fn matrix_param(db: &Database, env: &EngineEnv, node: Tag, name: &str) -> Result<Mat4> {
    let tag = env.nodes.get_param(db, node, name)?.as_tag().unwrap_or(NULL_TAG);
    if tag == NULL_TAG {
        return Ok(Mat4::identity());
    }
    let view = array::lease::<f32>(db, tag)?;
    if view.len() != 16 {
        return Ok(Mat4::identity());
    }
    let mut m = Mat4::identity();
    for (i, row) in m.m.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = *view.get(i * 4 + j);
        }
    }
    Ok(m)
}

/// Compilation output: light bindings done, tessellation jobs pending.
pub struct CompiledScene {
    /// Data array of light instance record tags.
    pub lights: Tag,
    /// Tessellation job tags, one per visible object instance.
    pub tessel_jobs: Vec<Tag>,
}

/// Walks the instance DAG from the root group, composing transforms
/// and instance attributes on the way down. The root attributes are
/// seeded from the global options.
pub fn compile(ctx: &SceneCtx, root_group: Tag, options: &Options) -> Result<CompiledScene> {
    let lights = array::create(&ctx.db, builtin::TYPE_TAG)?;
    let mut out = CompiledScene {
        lights,
        tessel_jobs: vec![],
    };
    walk_group(
        ctx,
        root_group,
        Mat4::identity(),
        Attributes::defaults(options),
        &mut out,
    )?;
    debug!(
        lights = array::size(&ctx.db, out.lights)?,
        objects = out.tessel_jobs.len(),
        "scene compiled"
    );
    Ok(out)
}

fn walk_group(
    ctx: &SceneCtx,
    group: Tag,
    xform: Mat4,
    attrs: Attributes,
    out: &mut CompiledScene,
) -> Result<()> {
    let elements = ctx
        .get(group, "elements")?
        .as_tag()
        .filter(|t| *t != NULL_TAG)
        .ok_or(Error::UnknownTag(group))?;

    for i in 0..array::size(&ctx.db, elements)? {
        let instance: Tag = array::get(&ctx.db, elements, i)?;
        walk_instance(ctx, instance, xform, attrs, out)?;
    }
    Ok(())
}

/// The instance's own attribute overrides, before inheritance.
fn instance_attrs(ctx: &SceneCtx, instance: Tag) -> Result<Attributes> {
    let mut attrs = Attributes::unset();
    if ctx.get(instance, "visible")?.as_int() == Some(0) {
        attrs.flags &= !types::ATTR_VISIBLE;
    }
    if ctx.get(instance, "cast_shadow")?.as_int() == Some(0) {
        attrs.flags &= !types::ATTR_CAST_SHADOW;
    }
    attrs.min_samples = ctx
        .get(instance, "min_samples")?
        .as_int()
        .unwrap_or(types::ATTR_INHERIT);
    attrs.max_samples = ctx
        .get(instance, "max_samples")?
        .as_int()
        .unwrap_or(types::ATTR_INHERIT);
    Ok(attrs)
}

fn walk_instance(
    ctx: &SceneCtx,
    instance: Tag,
    parent: Mat4,
    parent_attrs: Attributes,
    out: &mut CompiledScene,
) -> Result<()> {
    let mut attrs = instance_attrs(ctx, instance)?;
    attrs.inherit(&parent_attrs);
    if !attrs.visible() {
        return Ok(());
    }

    let local = matrix_param(&ctx.db, &ctx.env, instance, "transform")?;
    let xform = local.mul(&parent);
    let element = ctx
        .get(instance, "element")?
        .as_tag()
        .filter(|t| *t != NULL_TAG)
        .ok_or(Error::UnknownTag(instance))?;

    let desc = ctx.env.nodes.desc_of(&ctx.db, element)?;
    let is_desc = |name: &str| ctx.desc(name).map(|t| t == desc).unwrap_or(false);
    if is_desc("instgroup") {
        return walk_group(ctx, element, xform, attrs, out);
    }
    if is_desc("light") {
        return bind_light(ctx, element, xform, out);
    }
    if is_desc("polyobject") {
        let material = shader_list_of(ctx, instance)?;
        out.tessel_jobs
            .push(tessellate::create_job(&ctx.db, TesselJob {
                object: element,
                material,
                attrs,
                xform,
                output: NULL_TAG,
            })?);
        return Ok(());
    }
    // Cameras and unknown elements do not render.
    Ok(())
}

fn bind_light(ctx: &SceneCtx, light: Tag, xform: Mat4, out: &mut CompiledScene) -> Result<()> {
    let origin = ctx
        .get(light, "origin")?
        .as_vector()
        .unwrap_or_default();
    let energy = ctx
        .get(light, "energy")?
        .as_color()
        .unwrap_or(Color::gray(1.0));
    let intensity = ctx.get(light, "intensity")?.as_scalar().unwrap_or(1.0);

    let energy = energy * intensity;
    let inst = LightInst {
        origin: xform.transform_point(origin),
        _pad0: 0.0,
        energy,
        flux: energy.luminance().max(1e-6),
    };

    let (tag, lease) = ctx
        .db
        .create(types::TYPE_LIGHT_INST, std::mem::size_of::<LightInst>(), 0)?;
    *lease.get_mut::<LightInst>() = inst;
    drop(lease);

    array::push(&ctx.db, out.lights, tag)?;
    Ok(())
}

/// Shader list of the instance's material, or null.
fn shader_list_of(ctx: &SceneCtx, instance: Tag) -> Result<Tag> {
    let material = ctx
        .get(instance, "material")?
        .as_tag()
        .unwrap_or(NULL_TAG);
    if material == NULL_TAG {
        return Ok(NULL_TAG);
    }
    Ok(ctx
        .get(material, "shaders")?
        .as_tag()
        .unwrap_or(NULL_TAG))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> SceneCtx {
        let db = Arc::new(Database::new(0));
        crate::register_types(&db);
        SceneCtx::new(db).unwrap()
    }

    #[test]
    fn test_scene_construction() {
        let ctx = test_ctx();
        let opt = ctx.create_options().unwrap();
        ctx.set(opt, "res_x", ParamValue::Int(8)).unwrap();
        assert_eq!(ctx.get(opt, "res_x").unwrap(), ParamValue::Int(8));

        let obj = ctx
            .create_polyobject(
                &[
                    Vec3::new(0.0, 0.0, 0.0),
                    Vec3::new(1.0, 0.0, 0.0),
                    Vec3::new(0.0, 1.0, 0.0),
                ],
                &[0, 1, 2],
            )
            .unwrap();
        let inst = ctx.create_instance(obj).unwrap();
        let group = ctx.create_instgroup().unwrap();
        ctx.add_instance(group, inst).unwrap();

        let compiled = compile(&ctx, group, &Options::default()).unwrap();
        assert_eq!(compiled.tessel_jobs.len(), 1);
        assert_eq!(array::size(&ctx.db, compiled.lights).unwrap(), 0);
    }

    #[test]
    fn test_invisible_instances_are_skipped() {
        let ctx = test_ctx();
        let obj = ctx
            .create_polyobject(&[Vec3::default(); 3], &[0, 1, 2])
            .unwrap();
        let inst = ctx.create_instance(obj).unwrap();
        ctx.set(inst, "visible", ParamValue::Int(0)).unwrap();
        let group = ctx.create_instgroup().unwrap();
        ctx.add_instance(group, inst).unwrap();

        let compiled = compile(&ctx, group, &Options::default()).unwrap();
        assert!(compiled.tessel_jobs.is_empty());
    }

    #[test]
    fn test_light_binding_composes_transform() {
        let ctx = test_ctx();
        let light = ctx.create_light().unwrap();
        ctx.set(light, "origin", ParamValue::Vector(Vec3::new(0.0, 0.0, 1.0)))
            .unwrap();
        ctx.set(light, "intensity", ParamValue::Scalar(2.0)).unwrap();

        let inst = ctx.create_instance(light).unwrap();
        ctx.set_matrix(inst, "transform", Mat4::translation(Vec3::new(3.0, 0.0, 0.0)))
            .unwrap();
        let group = ctx.create_instgroup().unwrap();
        ctx.add_instance(group, inst).unwrap();

        let compiled = compile(&ctx, group, &Options::default()).unwrap();
        assert_eq!(array::size(&ctx.db, compiled.lights).unwrap(), 1);

        let light_tag: Tag = array::get(&ctx.db, compiled.lights, 0).unwrap();
        let lease = ctx.db.access(light_tag).unwrap();
        let li = *lease.get::<LightInst>();
        assert_eq!(li.origin, Vec3::new(3.0, 0.0, 1.0));
        assert!((li.energy.r - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_nested_groups() {
        let ctx = test_ctx();
        let obj = ctx
            .create_polyobject(&[Vec3::default(); 3], &[0, 1, 2])
            .unwrap();

        let inner = ctx.create_instgroup().unwrap();
        ctx.add_instance(inner, ctx.create_instance(obj).unwrap()).unwrap();

        let outer = ctx.create_instgroup().unwrap();
        let inner_inst = ctx.create_instance(inner).unwrap();
        ctx.add_instance(outer, inner_inst).unwrap();

        let compiled = compile(&ctx, outer, &Options::default()).unwrap();
        assert_eq!(compiled.tessel_jobs.len(), 1);
    }

    #[test]
    fn test_attribute_inheritance() {
        let mut child = Attributes::unset();
        child.max_samples = 16;

        let mut parent = Attributes::defaults(&Options::default());
        parent.flags &= !types::ATTR_CAST_SHADOW;
        parent.min_samples = 2;

        child.inherit(&parent);
        // Explicit override survives, unset fields follow the parent,
        // and a flag cleared above stays cleared.
        assert_eq!(child.max_samples, 16);
        assert_eq!(child.min_samples, 2);
        assert!(child.visible());
        assert!(!child.casts_shadow());
    }

    #[test]
    fn test_sample_overrides_reach_the_job() {
        let ctx = test_ctx();
        let obj = ctx
            .create_polyobject(&[Vec3::default(); 3], &[0, 1, 2])
            .unwrap();
        let inst = ctx.create_instance(obj).unwrap();
        ctx.set(inst, "min_samples", ParamValue::Int(2)).unwrap();
        ctx.set(inst, "max_samples", ParamValue::Int(16)).unwrap();
        let group = ctx.create_instgroup().unwrap();
        ctx.add_instance(group, inst).unwrap();

        let options = Options {
            min_samples: 1,
            max_samples: 4,
            ..Options::default()
        };
        let compiled = compile(&ctx, group, &options).unwrap();
        assert_eq!(compiled.tessel_jobs.len(), 1);

        let lease = ctx.db.access(compiled.tessel_jobs[0]).unwrap();
        let job = *lease.get::<TesselJob>();
        drop(lease);
        assert_eq!(job.attrs.min_samples, 2);
        assert_eq!(job.attrs.max_samples, 16);
        assert!(job.attrs.casts_shadow());
    }

    #[test]
    fn test_group_visibility_prunes_children() {
        let ctx = test_ctx();
        let obj = ctx
            .create_polyobject(&[Vec3::default(); 3], &[0, 1, 2])
            .unwrap();

        let inner = ctx.create_instgroup().unwrap();
        ctx.add_instance(inner, ctx.create_instance(obj).unwrap()).unwrap();

        let outer = ctx.create_instgroup().unwrap();
        let inner_inst = ctx.create_instance(inner).unwrap();
        ctx.set(inner_inst, "visible", ParamValue::Int(0)).unwrap();
        ctx.add_instance(outer, inner_inst).unwrap();

        let compiled = compile(&ctx, outer, &Options::default()).unwrap();
        assert!(compiled.tessel_jobs.is_empty());
    }
}
