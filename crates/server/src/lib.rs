//! Node-facing HTTP server for the fleet.
//!
//! This crate provides the agent protocol and the engines behind it:
//! - Enrollment, configuration and log endpoints
//! - Distributed query targeting, dispatch and result accounting
//! - File carving sessions, block ingestion and archival
//! - The batched writer for node check-ins
//! - Quick enroll/remove scripts

pub mod carving;
pub mod compression;
pub mod dispatch;
pub mod envcache;
pub mod error;
pub mod handlers;
pub mod logsink;
pub mod metrics;
pub mod ratelimit;
pub mod routes;
pub mod scripts;
pub mod state;
pub mod tasks;
pub mod writer;

pub use carving::{BlockReceipt, CarvingEngine};
pub use dispatch::{CarveRequest, Dispatched, Dispatcher, QueryRequest};
pub use error::ApiError;
pub use ratelimit::{ClientIp, RateLimitState};
pub use routes::create_router;
pub use state::AppState;
pub use writer::{CheckIn, MetadataWriter};
