//! The driver seam: network operations the runtime consumes.
//!
//! A production deployment plugs a wire-protocol driver in behind [`Driver`]; the
//! [`memory::MemoryDriver`] implements the same surface in-process.

pub mod eval;
pub mod memory;

use crate::errors::OdmError;
use crate::query::{Collation, ReadPreference};
use bson::Document;

pub use memory::MemoryDriver;

/// Opaque server cursor handle.
pub type CursorId = u64;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct WriteConcern {
    /// Number of acknowledging members; 0 = unacknowledged, -1 = majority.
    pub w: i32,
    #[serde(default)]
    pub journal: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WriteConcern {
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut d = Document::new();
        if self.w < 0 {
            d.insert("w", "majority");
        } else {
            d.insert("w", self.w);
        }
        d.insert("j", self.journal);
        if let Some(ms) = self.timeout_ms {
            d.insert("wtimeout", i64::try_from(ms).unwrap_or(i64::MAX));
        }
        d
    }
}

/// One find round trip, or the opening round trip of an iteration.
#[derive(Debug, Clone, Default)]
pub struct FindRequest {
    pub database: String,
    pub collection: String,
    pub filter: Document,
    pub sort: Document,
    pub projection: Option<Document>,
    pub skip: u64,
    /// 0 = no limit.
    pub limit: u64,
    pub batch_size: usize,
    pub read_preference: Option<ReadPreference>,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone, Default)]
pub struct CountRequest {
    pub database: String,
    pub collection: String,
    pub filter: Document,
    pub collation: Option<Collation>,
    pub read_preference: Option<ReadPreference>,
}

#[derive(Debug, Clone, Default)]
pub struct DistinctRequest {
    pub database: String,
    pub collection: String,
    pub field: String,
    pub filter: Document,
    pub collation: Option<Collation>,
    pub read_preference: Option<ReadPreference>,
}

#[derive(Debug, Clone, Default)]
pub struct FindAndModifyRequest {
    pub database: String,
    pub collection: String,
    pub filter: Document,
    pub sort: Document,
    /// `None` for find-and-delete.
    pub update: Option<Document>,
    pub return_new: bool,
    pub upsert: bool,
    pub collation: Option<Collation>,
}

/// A slice of a server-side result set.
#[derive(Debug, Clone, Default)]
pub struct CursorBatch {
    pub cursor_id: CursorId,
    pub documents: Vec<Document>,
    /// False once the server has handed out its last batch.
    pub has_more: bool,
}

/// A single write inside a bulk execution.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkRequest {
    Insert { document: Document },
    Update { filter: Document, update: Document, upsert: bool, multi: bool },
    Replace { filter: Document, replacement: Document, upsert: bool },
    Delete { filter: Document, multi: bool },
}

impl BulkRequest {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Replace { .. } => "replace",
            Self::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFailure {
    /// Position of the failing request in submission order.
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    pub deleted: u64,
    pub failures: Vec<BulkFailure>,
}

/// Accumulates writes against one collection, executed as one network call.
pub trait BulkContext: Send {
    fn collection(&self) -> &str;

    /// Append a request.
    ///
    /// # Errors
    /// `SubmissionRejected` when the context cannot take more requests locally.
    fn add_request(&mut self, request: BulkRequest) -> Result<(), OdmError>;

    /// How many more requests fit, when the context is bounded.
    fn remaining_capacity(&self) -> Option<usize> {
        None
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every appended request.
    ///
    /// # Errors
    /// `Transport` when the call as a whole fails; per-request failures are reported in
    /// [`BulkOutcome::failures`].
    fn execute(self: Box<Self>) -> Result<BulkOutcome, OdmError>;
}

/// Network operations consumed by the runtime. Implementations must be thread-safe.
pub trait Driver: Send + Sync {
    /// # Errors
    /// `Transport` on any network or server failure.
    fn find(&self, request: &FindRequest) -> Result<Vec<Document>, OdmError>;

    /// Open a server cursor and return its first batch (`request.batch_size` documents).
    ///
    /// # Errors
    /// `Transport` on any network or server failure.
    fn init_iteration(&self, request: &FindRequest) -> Result<CursorBatch, OdmError>;

    /// # Errors
    /// `CursorNotFound` for unknown or closed cursors, `Transport` otherwise.
    fn next_iteration(&self, cursor: CursorId, batch_size: usize) -> Result<CursorBatch, OdmError>;

    /// # Errors
    /// `CursorNotFound` for unknown or already closed cursors.
    fn close_iteration(&self, cursor: CursorId) -> Result<(), OdmError>;

    /// Exact filtered count.
    ///
    /// # Errors
    /// `Transport` on failure, including filters the server cannot count.
    fn count(&self, request: &CountRequest) -> Result<u64, OdmError>;

    /// Approximate collection size from metadata; not transaction-aware.
    ///
    /// # Errors
    /// `Transport` on failure.
    fn estimated_document_count(
        &self,
        database: &str,
        collection: &str,
        read_preference: Option<ReadPreference>,
    ) -> Result<u64, OdmError>;

    /// # Errors
    /// `Transport` on failure.
    fn distinct(&self, request: &DistinctRequest) -> Result<Vec<bson::Bson>, OdmError>;

    /// # Errors
    /// `Transport` on failure.
    fn find_one_and_delete(&self, request: &FindAndModifyRequest) -> Result<Option<Document>, OdmError>;

    /// # Errors
    /// `Transport` on failure.
    fn find_one_and_update(&self, request: &FindAndModifyRequest) -> Result<Option<Document>, OdmError>;

    fn create_bulk_context(
        &self,
        database: &str,
        collection: &str,
        ordered: bool,
        write_concern: Option<&WriteConcern>,
    ) -> Box<dyn BulkContext>;

    fn is_transaction_active(&self) -> bool {
        false
    }
}
