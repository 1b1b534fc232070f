//! Typed queries and their terminal calls.

mod cursor;
mod exec;
mod filter;
mod model;
mod prefetch;
mod types;

pub use cursor::{CursorState, QueryIterator, SharedQueryIterator};
pub use filter::{Field, FilterExpr, field};
pub use model::Query;
pub use prefetch::PrefetchIterator;
pub use types::{Collation, Order, Projection, ReadPreference, SortSpec, sort_document};
