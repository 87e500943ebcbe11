//! Repository traits for metadata operations.

pub mod carves;
pub mod environments;
pub mod logs;
pub mod nodes;
pub mod queries;
pub mod tags;

pub use carves::{BlockOutcome, BlockWrite, CarveRepo};
pub use environments::EnvironmentRepo;
pub use logs::LogRepo;
pub use nodes::NodeRepo;
pub use queries::{QueryRepo, RecordOutcome, ResultRecord};
pub use tags::TagRepo;
