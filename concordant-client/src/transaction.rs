//! Transactions: the only scope in which objects may be mutated.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::collection::{ConsistencyLevel, ObjectRef};
use crate::error::{ClientError, ClientResult};
use crate::ids::Timestamp;
use crate::session::SessionInner;

/// Unit of local mutation.
///
/// Created by [`Session::transaction`](crate::session::Session::transaction);
/// every object written through it is pushed in full when the body returns
/// successfully. There is no rollback: a failed body leaves its local
/// mutations in place and pushes nothing.
pub struct Transaction {
    session: Arc<SessionInner>,
    level: ConsistencyLevel,
    dirty: Mutex<Vec<ObjectRef>>,
}

impl Transaction {
    pub(crate) fn new(session: Arc<SessionInner>, level: ConsistencyLevel) -> Self {
        Self {
            session,
            level,
            dirty: Mutex::new(Vec::new()),
        }
    }

    pub fn level(&self) -> ConsistencyLevel {
        self.level
    }

    /// Record that `object` is about to be mutated.
    ///
    /// Fails with [`ClientError::ReadOnlyViolation`] if the object was opened
    /// read-only, and with [`ClientError::NotManaged`] if its collection is
    /// gone.
    pub fn on_write(&self, object: &ObjectRef) -> ClientResult<()> {
        if !self.session.is_writable(object)? {
            return Err(ClientError::ReadOnlyViolation(
                "object was opened read-only".to_string(),
            ));
        }
        let mut dirty = self.dirty.lock();
        if !dirty.iter().any(|o| o.ptr_eq(object)) {
            dirty.push(object.clone());
        }
        Ok(())
    }

    /// Number of distinct objects written so far.
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Rollback is not supported.
    pub fn abort(&self) -> ClientResult<()> {
        Err(ClientError::UnsupportedOperation("transaction abort"))
    }

    pub(crate) fn tick(&self) -> Timestamp {
        self.session.clock().tick()
    }

    /// Push the full state of every dirty object and clear the dirty set.
    ///
    /// Pushes run concurrently and in no particular order; each one retries
    /// until delivered. Returns the number of pushes issued.
    pub(crate) fn commit(&self) -> ClientResult<usize> {
        let dirty = std::mem::take(&mut *self.dirty.lock());
        let mut pushed = 0;
        for object in &dirty {
            let id = self.session.get_object_uid(object)?;
            let document = object.to_wire()?;
            log::debug!("Committing {id}");
            drop(self.session.adapter().update_object(id, document));
            pushed += 1;
        }
        Ok(pushed)
    }
}
