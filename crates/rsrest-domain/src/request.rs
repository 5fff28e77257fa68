//! Request handles for batch sub-requests.
//!
//! Every request taking part in a batch (the batch itself, each sequential
//! group, each leaf sub-request) gets a record in a [`RequestArena`]. Records
//! refer to their parent by [`RequestId`], so a handle never owns its parent
//! and there are no reference cycles between parents and children.
//!
//! Cancellation is a polled flag: setting it on any record cancels that
//! record and every descendant.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::http::Verb;

/// Index of a record in a [`RequestArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub usize);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

#[derive(Debug)]
struct RequestRecord {
    id: RequestId,
    parent: Option<RequestId>,
    verb: Verb,
    href: String,
    read_only: bool,
    cancelled: AtomicBool,
}

/// Append-only storage for the request records of one batch.
#[derive(Debug, Default)]
pub struct RequestArena {
    records: RwLock<Vec<Arc<RequestRecord>>>,
}

impl RequestArena {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a record with no parent.
    pub fn root(self: &Arc<Self>, verb: Verb, href: impl Into<String>, read_only: bool) -> RequestHandle {
        self.insert(None, verb, href.into(), read_only)
    }

    /// Creates a record whose parent is `parent`.
    pub fn child(
        self: &Arc<Self>,
        parent: &RequestHandle,
        verb: Verb,
        href: impl Into<String>,
        read_only: bool,
    ) -> RequestHandle {
        self.insert(Some(parent.id()), verb, href.into(), read_only)
    }

    /// Looks up a handle by id.
    pub fn get(self: &Arc<Self>, id: RequestId) -> Option<RequestHandle> {
        let record = self.records.read().get(id.0).cloned()?;
        Some(RequestHandle {
            record,
            arena: Arc::clone(self),
        })
    }

    /// Parent of the record `id`, if it has one.
    pub fn parent(self: &Arc<Self>, id: RequestId) -> Option<RequestHandle> {
        let parent = self.records.read().get(id.0)?.parent?;
        self.get(parent)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(
        self: &Arc<Self>,
        parent: Option<RequestId>,
        verb: Verb,
        href: String,
        read_only: bool,
    ) -> RequestHandle {
        let mut records = self.records.write();
        let record = Arc::new(RequestRecord {
            id: RequestId(records.len()),
            parent,
            verb,
            href,
            read_only,
            cancelled: AtomicBool::new(false),
        });
        records.push(Arc::clone(&record));
        RequestHandle {
            record,
            arena: Arc::clone(self),
        }
    }
}

/// Cheap, clonable view of one request record.
#[derive(Clone)]
pub struct RequestHandle {
    record: Arc<RequestRecord>,
    arena: Arc<RequestArena>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.record.id
    }

    pub fn verb(&self) -> Verb {
        self.record.verb
    }

    pub fn href(&self) -> &str {
        &self.record.href
    }

    pub fn is_read_only(&self) -> bool {
        self.record.read_only
    }

    pub fn arena(&self) -> &Arc<RequestArena> {
        &self.arena
    }

    pub fn parent(&self) -> Option<RequestHandle> {
        self.record.parent.and_then(|id| self.arena.get(id))
    }

    /// Walks up to the outermost ancestor.
    pub fn root(&self) -> RequestHandle {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Marks this request (and therefore all of its descendants) as cancelled.
    pub fn cancel(&self) {
        self.record.cancelled.store(true, Ordering::SeqCst);
    }

    /// True if this request or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.record.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let mut next = self.record.parent;
        while let Some(id) = next {
            match self.arena.get(id) {
                Some(parent) => {
                    if parent.record.cancelled.load(Ordering::SeqCst) {
                        return true;
                    }
                    next = parent.record.parent;
                }
                None => break,
            }
        }
        false
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.record.id)
            .field("parent", &self.record.parent)
            .field("verb", &self.record.verb)
            .field("href", &self.record.href)
            .field("read_only", &self.record.read_only)
            .finish()
    }
}
