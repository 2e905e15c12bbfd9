pub mod allocator;
pub mod bounds;
pub mod evaluator;
pub mod field;
pub mod material;
pub mod morton;
pub mod octree;
pub mod serialize;
#[allow(clippy::module_inception)]
pub mod volume;
