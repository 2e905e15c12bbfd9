pub mod jobs;
pub mod network;
pub mod transaction;
