//! Abbreviated data model produced by the decoders and persisted in the cache.
//!
//! Everything here is plain data: decoders return these by value, the cache
//! stores them as JSON, and downstream consumers (selection engine, authoring
//! converters) read them without touching container formats again.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Divisor for fixed-point world positions: 17 fractional bits.
pub const FIXED_POINT_ONE: i64 = 1 << 17;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Inverted box that expands onto the first point it sees.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn expand_by_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn expand_by_box(&mut self, other: &Self) {
        if !other.is_empty() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut aabb = Self::EMPTY;
        for p in points {
            aabb.expand_by_point(p);
        }
        aabb
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Decomposed local-to-world transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub orientation: Quat,
    pub scale: Vec3,
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Decode a fixed-point position component. `bits = 131072` is exactly `1.0`.
pub fn fixed_bits_to_float(bits: i64) -> f32 {
    bits as f64 as f32 / FIXED_POINT_ONE as f32
}

/// Inverse of [`fixed_bits_to_float`] for values representable in 17
/// fractional bits.
pub fn float_to_fixed_bits(value: f32) -> i64 {
    (value as f64 * FIXED_POINT_ONE as f64).round() as i64
}

/// Build a quaternion from container components.
///
/// Containers store quaternions scalar-last as `(i, j, k, r)`; glam wants
/// `(x, y, z, w)` which is the same order, so this is a direct mapping. Kept
/// as a named function so the convention is written down in exactly one place.
pub fn quat_from_ijkr(i: f32, j: f32, k: f32, r: f32) -> Quat {
    Quat::from_xyzw(i, j, k, r)
}

/// One decoded piece of renderable or collision geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubMesh {
    pub vertices: Vec<Vec3>,
    /// Vertex-index polygons. Triangles for render and triangle-mesh
    /// collision geometry; arbitrary face sizes for convex hulls.
    pub polygons: Vec<Vec<u32>>,
    pub aabb: Aabb,
    #[serde(default)]
    pub is_convex: bool,
}

impl SubMesh {
    /// Geometry-free submesh carrying only a stored bounding box.
    pub fn degenerate(aabb: Aabb) -> Self {
        Self {
            vertices: Vec::new(),
            polygons: Vec::new(),
            aabb,
            is_convex: false,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.vertices.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbbrMesh {
    pub submeshes: Vec<SubMesh>,
}

impl AbbrMesh {
    /// Union of submesh boxes.
    pub fn aabb(&self) -> Aabb {
        let mut aabb = Aabb::EMPTY;
        for sub in &self.submeshes {
            aabb.expand_by_box(&sub.aabb);
        }
        aabb
    }
}

/// Closed set of node kinds the selection pipeline cares about. Anything the
/// tag mapping does not recognize lands in `Other` and is carried through
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Mesh,
    InstancedMesh,
    Terrain,
    Collision,
    Entity,
    Decal,
    Other,
}

/// Explicit tag-to-kind mapping over the known node tags.
pub fn node_kind_from_tag(tag: &str) -> NodeKind {
    match tag {
        "worldMeshNode" | "worldStaticMeshNode" | "worldBendedMeshNode" => NodeKind::Mesh,
        "worldInstancedMeshNode" | "worldInstancedDestructibleMeshNode" => NodeKind::InstancedMesh,
        "worldTerrainMeshNode" => NodeKind::Terrain,
        "worldCollisionNode" => NodeKind::Collision,
        "worldEntityNode" | "worldPopulationSpawnerNode" => NodeKind::Entity,
        "worldStaticDecalNode" => NodeKind::Decal,
        _ => NodeKind::Other,
    }
}

/// One node of a streaming sector's flat node list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorNode {
    pub kind: NodeKind,
    pub type_tag: String,
    pub mesh_path: Option<String>,
    pub sector_hash: Option<u64>,
    pub debug_name: Option<String>,
    pub actors: Option<Vec<CollisionActor>>,
}

/// Per-node instance data: which node, where its instances sit, and an
/// optional stored box around all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDataEntry {
    pub node_index: usize,
    pub transforms: Vec<Transform>,
    pub aabb: Option<Aabb>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbbrSector {
    pub nodes: Vec<SectorNode>,
    pub node_data: Vec<NodeDataEntry>,
}

impl AbbrSector {
    /// Union of stored per-entry boxes. Entries without one contribute
    /// nothing.
    pub fn aabb(&self) -> Aabb {
        let mut aabb = Aabb::EMPTY;
        for entry in &self.node_data {
            if let Some(b) = entry.aabb.as_ref() {
                aabb.expand_by_box(b);
            }
        }
        aabb
    }
}

/// One collision actor of a collision-bearing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionActor {
    pub transform: Transform,
    pub shapes: Vec<ActorShape>,
}

/// A single shape under an actor, in actor-local space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorShape {
    pub shape_tag: String,
    pub transform: Transform,
    /// Content hash cross-referencing cached shape geometry, when the shape
    /// is mesh-backed rather than a primitive.
    pub content_hash: Option<u64>,
}
