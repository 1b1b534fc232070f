//! Utility modules: logging, developer bench lines, numeric conversions.
pub mod devlog;
pub mod logger;
pub mod num;
