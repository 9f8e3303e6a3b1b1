//! Collision-shape decoder.
//!
//! Two shape kinds come out of the physics cooker: convex hulls (vertex array
//! plus polygons referencing runs of 8-bit indices) and triangle meshes
//! (explicit index triples). Both carry a cooked AABB which is trusted as-is
//! instead of being recomputed from vertices.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Aabb, AbbrMesh, SubMesh};

/// One hull face: a contiguous run inside the 8-bit vertex index array.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HullPolygon {
    pub index_base: u16,
    pub vertex_count: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvexHull {
    pub vertices: Vec<Vec3>,
    pub polygons: Vec<HullPolygon>,
    pub indices: Vec<u8>,
    pub aabb: Aabb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangleMeshShape {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
    pub aabb: Aabb,
}

/// Closed union over the cooked shape kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollisionShapeData {
    Convex(ConvexHull),
    Triangles(TriangleMeshShape),
}

pub fn decode_convex(hull: &ConvexHull) -> Result<SubMesh> {
    let mut polygons = Vec::with_capacity(hull.polygons.len());
    for poly in &hull.polygons {
        let base = poly.index_base as usize;
        let count = poly.vertex_count as usize;
        if count < 3 {
            return Err(Error::decode(format!(
                "hull polygon at {base} has only {count} vertices"
            )));
        }
        let run = hull
            .indices
            .get(base..base + count)
            .ok_or_else(|| Error::decode(format!("hull polygon run {base}+{count} out of range")))?;

        let mut face = Vec::with_capacity(count);
        for &idx in run {
            if idx as usize >= hull.vertices.len() {
                return Err(Error::decode(format!(
                    "hull index {idx} out of range for {} vertices",
                    hull.vertices.len()
                )));
            }
            face.push(u32::from(idx));
        }
        polygons.push(face);
    }

    Ok(SubMesh {
        vertices: hull.vertices.clone(),
        polygons,
        // cooked hull AABB is authoritative
        aabb: hull.aabb,
        is_convex: true,
    })
}

pub fn decode_triangle_mesh(mesh: &TriangleMeshShape) -> Result<SubMesh> {
    let mut polygons = Vec::with_capacity(mesh.triangles.len());
    for tri in &mesh.triangles {
        for &idx in tri {
            if idx as usize >= mesh.vertices.len() {
                return Err(Error::decode(format!(
                    "triangle index {idx} out of range for {} vertices",
                    mesh.vertices.len()
                )));
            }
        }
        polygons.push(tri.to_vec());
    }

    Ok(SubMesh {
        vertices: mesh.vertices.clone(),
        polygons,
        aabb: mesh.aabb,
        is_convex: false,
    })
}

pub fn decode_collision(shape: &CollisionShapeData) -> Result<AbbrMesh> {
    let submesh = match shape {
        CollisionShapeData::Convex(hull) => decode_convex(hull)?,
        CollisionShapeData::Triangles(mesh) => decode_triangle_mesh(mesh)?,
    };
    Ok(AbbrMesh {
        submeshes: vec![submesh],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box_hull() -> ConvexHull {
        // square prism, two quad faces referenced through the index array
        ConvexHull {
            vertices: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0),
                Vec3::new(1.0, 0.0, 1.0),
                Vec3::new(1.0, 1.0, 1.0),
                Vec3::new(0.0, 1.0, 1.0),
            ],
            polygons: vec![
                HullPolygon { index_base: 0, vertex_count: 4 },
                HullPolygon { index_base: 4, vertex_count: 4 },
            ],
            indices: vec![0, 1, 2, 3, 4, 5, 6, 7],
            aabb: Aabb::new(Vec3::ZERO, Vec3::ONE),
        }
    }

    #[test]
    fn convex_hull_decodes_faces_and_keeps_stored_aabb() {
        let hull = unit_box_hull();
        let sub = decode_convex(&hull).unwrap();

        assert!(sub.is_convex);
        assert_eq!(sub.polygons, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
        // stored box, not recomputed: shrink it and confirm it passes through
        let mut shrunk = hull.clone();
        shrunk.aabb = Aabb::new(Vec3::ZERO, Vec3::splat(0.5));
        assert_eq!(decode_convex(&shrunk).unwrap().aabb, shrunk.aabb);
    }

    #[test]
    fn convex_hull_rejects_out_of_range_runs() {
        let mut hull = unit_box_hull();
        hull.polygons.push(HullPolygon { index_base: 6, vertex_count: 8 });
        assert!(matches!(decode_convex(&hull), Err(Error::Decode(_))));

        let mut hull = unit_box_hull();
        hull.indices[0] = 200;
        assert!(matches!(decode_convex(&hull), Err(Error::Decode(_))));
    }

    #[test]
    fn triangle_mesh_decodes_triples() {
        let mesh = TriangleMeshShape {
            vertices: vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z],
            triangles: vec![[0, 1, 2], [0, 2, 3]],
            aabb: Aabb::new(Vec3::ZERO, Vec3::ONE),
        };
        let sub = decode_triangle_mesh(&mesh).unwrap();
        assert!(!sub.is_convex);
        assert_eq!(sub.polygons.len(), 2);
        assert_eq!(sub.polygons[1], vec![0, 2, 3]);
        assert_eq!(sub.aabb, mesh.aabb);
    }

    #[test]
    fn collision_union_dispatches() {
        let shape = CollisionShapeData::Triangles(TriangleMeshShape {
            vertices: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            triangles: vec![[0, 1, 2]],
            aabb: Aabb::new(Vec3::ZERO, Vec3::ONE),
        });
        let mesh = decode_collision(&shape).unwrap();
        assert_eq!(mesh.submeshes.len(), 1);
    }
}
