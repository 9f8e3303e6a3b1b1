//! # redcache
//!
//! Persistent content cache and extraction pipeline for game archive assets.
//! Logical asset paths resolve through an indexed file map to their archive
//! container, raw bytes materialize once through the external archive tool,
//! and decoded geometry is normalized into a small data model that spatial
//! tooling can re-query without touching container formats again.
//!
//! ## Architecture
//!
//! - **cache**: LMDB-backed content store with fixed namespaces and
//!   transactional batch writes
//! - **index**: archive file-map builder (path -> archive id -> container)
//! - **tool**: external archive-tool wrapper (list/extract/uncook)
//! - **extract**: orchestration from cache miss to cached result, single and
//!   bulk, raw and decoded
//! - **mesh**: compiled-mesh decoder (LOD selection, dequantization)
//! - **physics**: collision-shape decoder (convex hulls, triangle meshes)
//! - **sector**: streaming-sector decoder (JSON sidecar and object model)
//! - **model**: the abbreviated data model shared by everything above
//! - **worker**: single background thread the pipeline runs on
//! - **config**: startup context, path resolution, version compatibility
//! - **error**: error taxonomy

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod index;
pub mod mesh;
pub mod model;
pub mod physics;
pub mod sector;
pub mod tool;
pub mod worker;
