use crate::driver::{BulkContext, BulkRequest};
use crate::entity::EntityMeta;
use crate::errors::OdmError;
use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Store,
    Set,
    Inc,
    Push,
    Pull,
    Unset,
    Delete,
}

impl WriteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Store => "store",
            Self::Set => "set",
            Self::Inc => "inc",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Unset => "unset",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handed to a completion callback once the operation's requests sit in a bulk context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub type_name: &'static str,
    pub collection: String,
    pub kind: WriteKind,
    pub requests: usize,
    /// False when the operation bypassed the queue.
    pub buffered: bool,
}

pub type WriteCallback = Box<dyn FnOnce(&WriteAck) + Send>;

/// A mutation waiting in its type's queue. Immutable once created.
pub struct PendingOperation {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) collection: String,
    pub(crate) enqueued_at: Instant,
    pub(crate) seq: u64,
    kind: WriteKind,
    requests: Vec<BulkRequest>,
    callback: Option<WriteCallback>,
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("type", &self.type_name)
            .field("collection", &self.collection)
            .field("kind", &self.kind)
            .field("seq", &self.seq)
            .field("requests", &self.requests.len())
            .finish()
    }
}

impl PendingOperation {
    #[must_use]
    pub fn new(meta: &EntityMeta, collection: impl Into<String>, kind: WriteKind, requests: Vec<BulkRequest>) -> Self {
        Self {
            type_id: meta.type_id,
            type_name: meta.type_name,
            collection: collection.into(),
            enqueued_at: Instant::now(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            kind,
            requests,
            callback: None,
        }
    }

    #[must_use]
    pub fn with_callback(mut self, callback: WriteCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    #[must_use]
    pub fn kind(&self) -> WriteKind {
        self.kind
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[must_use]
    pub fn requests(&self) -> &[BulkRequest] {
        &self.requests
    }

    /// Queue order: timestamp, then creation sequence.
    pub(crate) fn age_key(&self) -> (Instant, u64) {
        (self.enqueued_at, self.seq)
    }

    /// Translate into wire requests on `ctx`. All-or-nothing with respect to local capacity.
    ///
    /// # Errors
    /// `SubmissionRejected` when the context cannot take every request.
    pub fn append_to(&self, ctx: &mut dyn BulkContext) -> Result<(), OdmError> {
        if let Some(free) = ctx.remaining_capacity()
            && free < self.requests.len()
        {
            return Err(OdmError::SubmissionRejected(format!(
                "{} needs {} slots, {} free in bulk context for {}",
                self, self.requests.len(), free, self.collection
            )));
        }
        for r in &self.requests {
            ctx.add_request(r.clone())?;
        }
        Ok(())
    }

    /// Fire the completion callback, at most once.
    pub fn complete(&mut self, buffered: bool) {
        if let Some(cb) = self.callback.take() {
            let ack = WriteAck {
                type_name: self.type_name,
                collection: self.collection.clone(),
                kind: self.kind,
                requests: self.requests.len(),
                buffered,
            };
            cb(&ack);
        }
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} on {}.{}", self.kind, self.seq, self.type_name, self.collection)
    }
}

/// One oldest operation by timestamp; ties broken by creation order.
pub(crate) fn oldest_index(ops: &[PendingOperation]) -> Option<usize> {
    ops.iter().enumerate().min_by_key(|(_, op)| op.age_key()).map(|(i, _)| i)
}
