//! Hybrid sparse-voxel-octree + multi-channel signed-distance-field volume
//! engine. Stores editable terrain as a sparse octree whose interface nodes
//! carry per-material distance fields, and layers boolean sculpting,
//! optimistic transactions and delta replication on top.

pub mod config;
pub mod error;
pub mod systems;
pub mod volume;

pub use config::VolumeConfig;
pub use error::{VolumeError, VolumeResult};
pub use volume::volume::Volume;
