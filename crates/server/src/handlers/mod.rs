//! HTTP request handlers.

pub mod carves;
pub mod common;
pub mod config;
pub mod enroll;
pub mod health;
pub mod logs;
pub mod queries;
pub mod scripts;

pub use carves::*;
pub use config::*;
pub use enroll::*;
pub use health::*;
pub use logs::*;
pub use queries::*;
pub use scripts::*;
