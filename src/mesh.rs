//! Compiled-mesh decoder.
//!
//! Render chunks carry quantized vertex data: signed 16-bit triples plus a
//! per-chunk linear scale/offset. Only the coarsest LOD is decoded; the
//! selection pipeline needs silhouettes, not detail, and the coarsest chunk
//! is the cheapest one that still covers the asset. Occlusion-only assets
//! have no render blob at all and decode to a single degenerate submesh that
//! carries nothing but the stored bounding box.

use byteorder::{ByteOrder, LittleEndian};
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Aabb, AbbrMesh, SubMesh};

/// Denominator for 16-bit signed quantization.
const QUANT_SCALE: f32 = i16::MAX as f32;

/// One render chunk as stored in the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderChunk {
    /// LOD tag; higher is coarser.
    pub lod: u8,
    /// Byte offset of this chunk's first vertex in the vertex buffer.
    pub vertex_offset: u32,
    pub vertex_count: u32,
    /// Byte stride between vertex slots.
    pub vertex_stride: u8,
    /// Element offset (u16 units) of this chunk's first index in the shared
    /// index buffer.
    pub index_offset: u32,
    pub index_count: u32,
    pub quant_scale: Vec3,
    pub quant_offset: Vec3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderBlob {
    pub chunks: Vec<RenderChunk>,
    pub vertex_buffer: Vec<u8>,
    pub index_buffer: Vec<u8>,
}

/// Parsed container object for a compiled mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledMesh {
    /// Absent for occlusion-only assets.
    pub render: Option<RenderBlob>,
    /// Bounding box stored in the container header.
    pub aabb: Aabb,
}

/// Decode a compiled mesh into one submesh per coarsest-LOD chunk.
pub fn decode_mesh(mesh: &CompiledMesh) -> Result<AbbrMesh> {
    let Some(render) = mesh.render.as_ref() else {
        return Ok(AbbrMesh {
            submeshes: vec![SubMesh::degenerate(mesh.aabb)],
        });
    };

    let Some(max_lod) = render.chunks.iter().map(|c| c.lod).max() else {
        return Err(Error::decode("render blob has no chunks"));
    };

    let mut submeshes = Vec::new();
    for chunk in render.chunks.iter().filter(|c| c.lod == max_lod) {
        submeshes.push(decode_chunk(chunk, &render.vertex_buffer, &render.index_buffer)?);
    }

    Ok(AbbrMesh { submeshes })
}

fn decode_chunk(chunk: &RenderChunk, vertices: &[u8], indices: &[u8]) -> Result<SubMesh> {
    let stride = chunk.vertex_stride as usize;
    if stride < 6 {
        return Err(Error::decode(format!(
            "vertex stride {stride} cannot hold three i16 components"
        )));
    }

    let base = chunk.vertex_offset as usize;
    let count = chunk.vertex_count as usize;
    let end = base
        .checked_add(count.saturating_mul(stride))
        .ok_or_else(|| Error::decode("vertex range overflows"))?;
    if end > vertices.len() {
        return Err(Error::decode(format!(
            "vertex range {base}..{end} exceeds buffer of {} bytes",
            vertices.len()
        )));
    }

    let mut decoded = Vec::with_capacity(count);
    for i in 0..count {
        let at = base + i * stride;
        let raw_x = LittleEndian::read_i16(&vertices[at..at + 2]);
        let raw_y = LittleEndian::read_i16(&vertices[at + 2..at + 4]);
        let raw_z = LittleEndian::read_i16(&vertices[at + 4..at + 6]);
        decoded.push(dequantize(
            [raw_x, raw_y, raw_z],
            chunk.quant_scale,
            chunk.quant_offset,
        ));
    }

    let polygons = decode_triangles(chunk, indices, count)?;
    let aabb = Aabb::from_points(decoded.iter().copied());

    Ok(SubMesh {
        vertices: decoded,
        polygons,
        aabb,
        is_convex: false,
    })
}

fn dequantize(raw: [i16; 3], scale: Vec3, offset: Vec3) -> Vec3 {
    Vec3::new(
        raw[0] as f32 / QUANT_SCALE * scale.x + offset.x,
        raw[1] as f32 / QUANT_SCALE * scale.y + offset.y,
        raw[2] as f32 / QUANT_SCALE * scale.z + offset.z,
    )
}

fn decode_triangles(
    chunk: &RenderChunk,
    indices: &[u8],
    vertex_count: usize,
) -> Result<Vec<Vec<u32>>> {
    if chunk.index_count % 3 != 0 {
        return Err(Error::decode(format!(
            "index count {} is not a multiple of three",
            chunk.index_count
        )));
    }

    let first = chunk.index_offset as usize;
    let count = chunk.index_count as usize;
    let end_byte = (first + count)
        .checked_mul(2)
        .ok_or_else(|| Error::decode("index range overflows"))?;
    if end_byte > indices.len() {
        return Err(Error::decode(format!(
            "index range exceeds buffer of {} bytes",
            indices.len()
        )));
    }

    let mut polygons = Vec::with_capacity(count / 3);
    for tri in 0..count / 3 {
        let at = (first + tri * 3) * 2;
        let mut face = Vec::with_capacity(3);
        for corner in 0..3 {
            let idx = LittleEndian::read_u16(&indices[at + corner * 2..at + corner * 2 + 2]);
            if idx as usize >= vertex_count {
                return Err(Error::decode(format!(
                    "index {idx} out of range for {vertex_count} vertices"
                )));
            }
            face.push(u32::from(idx));
        }
        polygons.push(face);
    }

    Ok(polygons)
}
