//! Site-blocking timer service.
//!
//! Sites are either blocked outright or given a daily time budget that a live
//! page session spends while visible. Once the budget is gone, navigation to
//! the host is redirected to a block page until the next local midnight.
pub mod alarm;
pub mod api;
pub mod budget;
pub mod config;
pub mod decision;
pub mod enforcement;
pub mod filter;
pub mod models;
pub mod registry;
pub mod session;
pub mod tabs;
pub mod time;
pub mod utils;

pub use decision::{BlockingService, Decision, ServiceError, ServiceResult};
pub use registry::{RegistryError, SiteRegistry};
