pub mod buffer;
pub mod cache;
pub mod config;
pub mod driver;
pub mod entity;
pub mod errors;
pub mod odm;
pub mod pool;
pub mod query;
pub mod stats;
pub mod utils;

pub use crate::buffer::{EnqueueOutcome, WriteAck, WriteKind};
pub use crate::config::OdmConfig;
pub use crate::entity::{CacheSettings, Entity, EntityRegistry, OverflowPolicy, WriteBufferSettings};
pub use crate::errors::OdmError;
pub use crate::odm::Odm;
pub use crate::query::{FilterExpr, Order, Query, field};
pub use crate::stats::{ProfilingListener, StatsSnapshot};

/// Initializes logging from `NEXUS_ODM_*` environment variables.
///
/// Call once before building an [`Odm`]; later calls keep the first configuration.
///
/// # Errors
/// `Config` when the log directory or logger cannot be set up.
pub fn init() -> Result<(), OdmError> {
    utils::logger::configure_from_env()
}
