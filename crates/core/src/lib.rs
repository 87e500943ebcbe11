//! Core domain types and shared logic for the fleet node protocol engine.
//!
//! This crate defines the data model shared by the metadata store and the
//! server:
//! - Tenant (environment) identifiers
//! - Node session keys, device identity and check-in channels
//! - Carve session states, carve queries and archive naming
//! - Distributed query kinds and target resolution
//! - Agent protocol request/response bodies
//! - Configuration

pub mod carve;
pub mod config;
pub mod environment;
pub mod error;
pub mod node;
pub mod protocol;
pub mod query;

pub use carve::{CarveGeometry, CarveStatus, CarverBackend};
pub use environment::EnvId;
pub use error::{Error, Result};
pub use node::{ChannelSet, NodeChannel, NodeKeyGenerator};
pub use query::{LogType, NodeQueryStatus, QueryType, TargetSet, TargetSpec};
