//! Streaming-sector decoder.
//!
//! A sector is a flat node list plus a parallel node-data list mapping each
//! placed instance back to its node. Input arrives in two representations:
//! the JSON sidecar the archive tool uncooks, and the already-parsed
//! container object model. Both lower into [`SectorObject`] and then through
//! one decode path, so they cannot drift apart.
//!
//! Missing optional fields degrade to zero/identity with a recorded warning.
//! Missing structural fields (node index, instanced-slice bounds) fail the
//! sector; callers decoding batches keep going with the remaining sectors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{
    Aabb, AbbrSector, ActorShape, CollisionActor, NodeDataEntry, NodeKind, SectorNode, Transform,
    fixed_bits_to_float, node_kind_from_tag, quat_from_ijkr,
};

use glam::Vec3;

/// Parsed container object for a streaming sector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectorObject {
    pub nodes: Vec<NodeObject>,
    pub node_data: Vec<NodeDataObject>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeObject {
    pub type_tag: Option<String>,
    pub mesh_path: Option<String>,
    pub sector_hash: Option<u64>,
    pub debug_name: Option<String>,
    pub instances: Option<InstanceBuffer>,
    pub actors: Option<Vec<ActorObject>>,
}

/// Shared transform buffer plus the slice an instanced node owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceBuffer {
    pub start_index: Option<u32>,
    pub num_elements: Option<u32>,
    pub transforms: Vec<TransformObject>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransformObject {
    pub position: Option<[f32; 3]>,
    /// Scalar-last `(i, j, k, r)`.
    pub orientation: Option<[f32; 4]>,
    pub scale: Option<[f32; 3]>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeDataObject {
    pub node_index: Option<u32>,
    pub position: Option<[f32; 3]>,
    pub orientation: Option<[f32; 4]>,
    pub scale: Option<[f32; 3]>,
    pub bounds: Option<Aabb>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorObject {
    /// World position in fixed-point bits (17 fractional bits per axis).
    pub position_bits: Option<[i64; 3]>,
    pub orientation: Option<[f32; 4]>,
    pub scale: Option<[f32; 3]>,
    pub shapes: Vec<ShapeObject>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShapeObject {
    pub shape_tag: Option<String>,
    pub position: Option<[f32; 3]>,
    pub rotation: Option<[f32; 4]>,
    pub scale: Option<[f32; 3]>,
    pub content_hash: Option<u64>,
}

/// Decode result plus the degradations that happened along the way.
#[derive(Debug, Clone, Default)]
pub struct SectorDecode {
    pub sector: AbbrSector,
    pub warnings: Vec<String>,
}

/// Decode a sector from the parsed object model.
pub fn decode_sector(obj: &SectorObject) -> Result<SectorDecode> {
    let mut warnings = Vec::new();

    let mut nodes = Vec::with_capacity(obj.nodes.len());
    for (i, node) in obj.nodes.iter().enumerate() {
        nodes.push(build_node(node, i, &mut warnings));
    }

    let mut node_data = Vec::with_capacity(obj.node_data.len());
    for (i, entry) in obj.node_data.iter().enumerate() {
        node_data.push(build_node_data(obj, &nodes, entry, i, &mut warnings)?);
    }

    for w in &warnings {
        warn!("{w}");
    }

    Ok(SectorDecode {
        sector: AbbrSector { nodes, node_data },
        warnings,
    })
}

/// Decode a sector from the tool's uncooked JSON sidecar.
pub fn decode_sector_json(value: &Value) -> Result<SectorDecode> {
    let obj = lower_sector(value)?;
    decode_sector(&obj)
}

fn build_node(node: &NodeObject, index: usize, warnings: &mut Vec<String>) -> SectorNode {
    let type_tag = match node.type_tag.as_deref() {
        Some(tag) => tag.to_string(),
        None => {
            warnings.push(format!("node {index}: missing type tag"));
            String::new()
        }
    };

    let actors = node.actors.as_ref().map(|actors| {
        actors
            .iter()
            .enumerate()
            .map(|(ai, actor)| build_actor(actor, index, ai, warnings))
            .collect()
    });

    SectorNode {
        kind: node_kind_from_tag(&type_tag),
        type_tag,
        mesh_path: node.mesh_path.clone(),
        sector_hash: node.sector_hash,
        debug_name: node.debug_name.clone(),
        actors,
    }
}

fn build_actor(
    actor: &ActorObject,
    node_index: usize,
    actor_index: usize,
    warnings: &mut Vec<String>,
) -> CollisionActor {
    let what = format!("node {node_index} actor {actor_index}");

    let position = match actor.position_bits {
        Some(bits) => Vec3::new(
            fixed_bits_to_float(bits[0]),
            fixed_bits_to_float(bits[1]),
            fixed_bits_to_float(bits[2]),
        ),
        None => {
            warnings.push(format!("{what}: missing position, defaulting to zero"));
            Vec3::ZERO
        }
    };
    let orientation = orientation_or_default(actor.orientation, &what, warnings);
    let scale = scale_or_default(actor.scale, &what, warnings);

    let shapes = actor
        .shapes
        .iter()
        .enumerate()
        .map(|(si, shape)| build_shape(shape, &what, si, warnings))
        .collect();

    CollisionActor {
        transform: Transform {
            position,
            orientation,
            scale,
        },
        shapes,
    }
}

fn build_shape(
    shape: &ShapeObject,
    actor_what: &str,
    shape_index: usize,
    warnings: &mut Vec<String>,
) -> ActorShape {
    let what = format!("{actor_what} shape {shape_index}");

    let shape_tag = match shape.shape_tag.as_deref() {
        Some(tag) => tag.to_string(),
        None => {
            warnings.push(format!("{what}: missing shape type"));
            String::new()
        }
    };

    let position = match shape.position {
        Some(p) => Vec3::from(p),
        None => {
            warnings.push(format!("{what}: missing position, defaulting to zero"));
            Vec3::ZERO
        }
    };
    let orientation = orientation_or_default(shape.rotation, &what, warnings);
    let scale = scale_or_default(shape.scale, &what, warnings);

    ActorShape {
        shape_tag,
        transform: Transform {
            position,
            orientation,
            scale,
        },
        content_hash: shape.content_hash,
    }
}

fn build_node_data(
    obj: &SectorObject,
    nodes: &[SectorNode],
    entry: &NodeDataObject,
    index: usize,
    warnings: &mut Vec<String>,
) -> Result<NodeDataEntry> {
    let node_index = entry
        .node_index
        .ok_or_else(|| Error::decode(format!("node data entry {index}: missing node index")))?
        as usize;
    if node_index >= nodes.len() {
        return Err(Error::decode(format!(
            "node data entry {index}: node index {node_index} out of range for {} nodes",
            nodes.len()
        )));
    }

    let transforms = if nodes[node_index].kind == NodeKind::InstancedMesh {
        sliced_transforms(obj, node_index, warnings)?
    } else {
        let what = format!("node data entry {index}");
        let position = match entry.position {
            Some(p) => Vec3::from(p),
            None => {
                warnings.push(format!("{what}: missing position, defaulting to zero"));
                Vec3::ZERO
            }
        };
        let orientation = orientation_or_default(entry.orientation, &what, warnings);
        let scale = scale_or_default(entry.scale, &what, warnings);
        vec![Transform {
            position,
            orientation,
            scale,
        }]
    };

    Ok(NodeDataEntry {
        node_index,
        transforms,
        aabb: entry.bounds,
    })
}

/// Resolve the transform slice of an instanced node. There is no way to
/// default a missing slice bound: without it no valid slice exists, so this
/// is a hard failure for the sector.
fn sliced_transforms(
    obj: &SectorObject,
    node_index: usize,
    warnings: &mut Vec<String>,
) -> Result<Vec<Transform>> {
    let buffer = obj.nodes[node_index]
        .instances
        .as_ref()
        .ok_or_else(|| {
            Error::decode(format!(
                "instanced node {node_index}: missing transform buffer"
            ))
        })?;

    let start = buffer.start_index.ok_or_else(|| {
        Error::decode(format!("instanced node {node_index}: missing start index"))
    })? as usize;
    let count = buffer.num_elements.ok_or_else(|| {
        Error::decode(format!("instanced node {node_index}: missing element count"))
    })? as usize;

    let slice = buffer.transforms.get(start..start + count).ok_or_else(|| {
        Error::decode(format!(
            "instanced node {node_index}: slice {start}..{} exceeds buffer of {}",
            start + count,
            buffer.transforms.len()
        ))
    })?;

    let what = format!("instanced node {node_index}");
    Ok(slice
        .iter()
        .map(|t| {
            let position = match t.position {
                Some(p) => Vec3::from(p),
                None => {
                    warnings.push(format!("{what}: missing instance position, defaulting to zero"));
                    Vec3::ZERO
                }
            };
            let orientation = orientation_or_default(t.orientation, &what, warnings);
            let scale = scale_or_default(t.scale, &what, warnings);
            Transform {
                position,
                orientation,
                scale,
            }
        })
        .collect())
}

fn orientation_or_default(
    raw: Option<[f32; 4]>,
    what: &str,
    warnings: &mut Vec<String>,
) -> glam::Quat {
    match raw {
        Some([i, j, k, r]) => quat_from_ijkr(i, j, k, r),
        None => {
            warnings.push(format!("{what}: missing orientation, defaulting to identity"));
            glam::Quat::IDENTITY
        }
    }
}

fn scale_or_default(raw: Option<[f32; 3]>, what: &str, warnings: &mut Vec<String>) -> Vec3 {
    match raw {
        Some(s) => Vec3::from(s),
        None => {
            warnings.push(format!("{what}: missing scale, defaulting to identity"));
            Vec3::ONE
        }
    }
}

// ---------------------------------------------------------------------------
// JSON lowering

fn lower_sector(value: &Value) -> Result<SectorObject> {
    let root = value.get("rootChunk").unwrap_or(value);

    let nodes = root
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::decode("sector JSON has no nodes list"))?;
    let node_data = root
        .get("nodeData")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::decode("sector JSON has no nodeData list"))?;

    Ok(SectorObject {
        nodes: nodes.iter().map(lower_node).collect(),
        node_data: node_data.iter().map(lower_node_data).collect(),
    })
}

fn lower_node(value: &Value) -> NodeObject {
    NodeObject {
        type_tag: value
            .get("$type")
            .and_then(Value::as_str)
            .map(str::to_string),
        mesh_path: lower_mesh_path(value),
        sector_hash: value.get("sectorHash").and_then(Value::as_u64),
        debug_name: value
            .get("debugName")
            .and_then(Value::as_str)
            .map(str::to_string),
        instances: value.get("worldTransformsBuffer").map(lower_instances),
        actors: value
            .get("compiledData")
            .and_then(|c| c.get("actors"))
            .and_then(Value::as_array)
            .map(|actors| actors.iter().map(lower_actor).collect()),
    }
}

/// The mesh reference appears under two field names depending on node type;
/// the first one present wins.
fn lower_mesh_path(value: &Value) -> Option<String> {
    for field in ["mesh", "meshRef"] {
        if let Some(path) = value
            .get(field)
            .and_then(|m| m.get("path"))
            .and_then(Value::as_str)
        {
            return Some(path.to_string());
        }
    }
    None
}

fn lower_instances(value: &Value) -> InstanceBuffer {
    InstanceBuffer {
        start_index: value
            .get("startIndex")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        num_elements: value
            .get("numElements")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        transforms: value
            .get("sharedDataBuffer")
            .and_then(Value::as_array)
            .map(|buf| buf.iter().map(lower_transform).collect())
            .unwrap_or_default(),
    }
}

fn lower_transform(value: &Value) -> TransformObject {
    TransformObject {
        position: lower_vec3(value.get("position")),
        orientation: lower_quat(value.get("orientation")),
        scale: lower_vec3(value.get("scale")),
    }
}

fn lower_node_data(value: &Value) -> NodeDataObject {
    NodeDataObject {
        node_index: value
            .get("nodeIndex")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        position: lower_vec3(value.get("position")),
        orientation: lower_quat(value.get("orientation")),
        scale: lower_vec3(value.get("scale")),
        bounds: lower_bounds(value.get("bounds")),
    }
}

fn lower_actor(value: &Value) -> ActorObject {
    ActorObject {
        position_bits: lower_fixed_vec3(value.get("position")),
        orientation: lower_quat(value.get("orientation")),
        scale: lower_vec3(value.get("scale")),
        shapes: value
            .get("shapes")
            .and_then(Value::as_array)
            .map(|shapes| shapes.iter().map(lower_shape).collect())
            .unwrap_or_default(),
    }
}

fn lower_shape(value: &Value) -> ShapeObject {
    let shape_tag = value
        .get("shapeType")
        .or_else(|| value.get("$type"))
        .and_then(Value::as_str)
        .map(str::to_string);

    ShapeObject {
        shape_tag,
        position: lower_vec3(value.get("position")),
        rotation: lower_quat(value.get("rotation")),
        scale: lower_vec3(value.get("scale")),
        content_hash: value.get("hash").and_then(Value::as_u64),
    }
}

fn lower_vec3(value: Option<&Value>) -> Option<[f32; 3]> {
    let v = value?;
    Some([
        component_f32(v, "x")?,
        component_f32(v, "y")?,
        component_f32(v, "z")?,
    ])
}

fn lower_quat(value: Option<&Value>) -> Option<[f32; 4]> {
    let v = value?;
    Some([
        component_f32(v, "i")?,
        component_f32(v, "j")?,
        component_f32(v, "k")?,
        component_f32(v, "r")?,
    ])
}

/// Fixed-point world positions nest the raw bits one level down.
fn lower_fixed_vec3(value: Option<&Value>) -> Option<[i64; 3]> {
    let v = value?;
    Some([
        v.get("x")?.get("bits")?.as_i64()?,
        v.get("y")?.get("bits")?.as_i64()?,
        v.get("z")?.get("bits")?.as_i64()?,
    ])
}

fn lower_bounds(value: Option<&Value>) -> Option<Aabb> {
    let v = value?;
    let min = lower_vec3(v.get("min"))?;
    let max = lower_vec3(v.get("max"))?;
    Some(Aabb::new(Vec3::from(min), Vec3::from(max)))
}

fn component_f32(value: &Value, key: &str) -> Option<f32> {
    value.get(key).and_then(Value::as_f64).map(|v| v as f32)
}
