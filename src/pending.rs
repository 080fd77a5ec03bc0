//! Pending-request table: correlates data-chunk frames with waiting reads.
//!
//! A loader that needs bulk data registers a slot, sends a data request
//! carrying the slot's id and then waits on the returned [`PendingRead`].
//! The read loop hands every data-chunk frame to [`PendingRequests::resolve`],
//! which removes the slot and wakes the waiter. Each slot resolves at most
//! once; a second frame for the same id finds nothing and is reported as
//! [`RuntimeError::UnknownRequest`].
//!
//! Dropping a `PendingRead` before it resolves (the owning call failed or was
//! abandoned) removes its slot, so the table does not grow with dead entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Result, RuntimeError};

struct Slot {
    ticket: u64,
    tx: oneshot::Sender<Vec<Bytes>>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<u32, Slot>>,
    next_id: AtomicU32,
    next_ticket: AtomicU64,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<u32, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Table of outstanding reads, shared by the read loop and every call.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Inner>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh request id and a slot for its resolution.
    pub fn register(&self) -> PendingRead {
        let (tx, rx) = oneshot::channel();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut slots = self.inner.slots();
        // Ids wrap after u32::MAX registrations; skip any still in use.
        let id = loop {
            let candidate = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if !slots.contains_key(&candidate) {
                break candidate;
            }
        };
        slots.insert(id, Slot { ticket, tx });

        PendingRead {
            id,
            ticket,
            rx,
            table: self.clone(),
            finished: false,
        }
    }

    /// Deliver `segments` to the read registered under `request_id`.
    ///
    /// Fails with [`RuntimeError::UnknownRequest`] if no such read is
    /// outstanding (never registered, already resolved or abandoned).
    pub fn resolve(&self, request_id: u32, segments: Vec<Bytes>) -> Result<()> {
        let slot = self
            .inner
            .slots()
            .remove(&request_id)
            .ok_or(RuntimeError::UnknownRequest(request_id))?;

        if slot.tx.send(segments).is_err() {
            tracing::debug!("Reader for request {} went away before delivery", request_id);
        }
        Ok(())
    }

    /// Drop every outstanding slot. Waiters observe a closed connection.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.inner.slots().drain().collect();
        if !drained.is_empty() {
            tracing::debug!("Abandoning {} pending reads", drained.len());
        }
    }

    /// Number of outstanding reads.
    pub fn len(&self) -> usize {
        self.inner.slots().len()
    }

    /// Check if no reads are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if `request_id` is outstanding.
    pub fn contains(&self, request_id: u32) -> bool {
        self.inner.slots().contains_key(&request_id)
    }

    fn deregister(&self, request_id: u32, ticket: u64) {
        let mut slots = self.inner.slots();
        if slots.get(&request_id).map(|s| s.ticket) == Some(ticket) {
            slots.remove(&request_id);
        }
    }
}

/// A registered read waiting for its data-chunk frame.
pub struct PendingRead {
    id: u32,
    ticket: u64,
    rx: oneshot::Receiver<Vec<Bytes>>,
    table: PendingRequests,
    finished: bool,
}

impl PendingRead {
    /// The request id to put on the wire.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the resolution.
    ///
    /// Fails with [`RuntimeError::ConnectionClosed`] if the table was closed
    /// before a data-chunk frame arrived.
    pub async fn wait(mut self) -> Result<Vec<Bytes>> {
        let result = (&mut self.rx).await;
        self.finished = true;
        result.map_err(|_| RuntimeError::ConnectionClosed)
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        if !self.finished {
            self.table.deregister(self.id, self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_distinct_ids() {
        let table = PendingRequests::new();
        let a = table.register();
        let b = table.register();

        assert_ne!(a.id(), b.id());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let table = PendingRequests::new();
        let read = table.register();
        let id = read.id();

        table
            .resolve(id, vec![Bytes::from_static(b"payload")])
            .unwrap();
        assert_eq!(
            read.wait().await.unwrap(),
            vec![Bytes::from_static(b"payload")]
        );

        // Second resolution for the same id is rejected, not delivered.
        let again = table.resolve(id, vec![]);
        assert!(matches!(again, Err(RuntimeError::UnknownRequest(x)) if x == id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolve_unknown_id() {
        let table = PendingRequests::new();
        let result = table.resolve(999, vec![]);
        assert!(matches!(result, Err(RuntimeError::UnknownRequest(999))));
    }

    #[tokio::test]
    async fn test_out_of_order_resolution() {
        let table = PendingRequests::new();
        let first = table.register();
        let second = table.register();

        table
            .resolve(second.id(), vec![Bytes::from_static(b"2")])
            .unwrap();
        table
            .resolve(first.id(), vec![Bytes::from_static(b"1")])
            .unwrap();

        assert_eq!(first.wait().await.unwrap()[0], Bytes::from_static(b"1"));
        assert_eq!(second.wait().await.unwrap()[0], Bytes::from_static(b"2"));
    }

    #[test]
    fn test_drop_deregisters() {
        let table = PendingRequests::new();
        let read = table.register();
        let id = read.id();

        drop(read);

        assert!(!table.contains(id));
        assert!(matches!(
            table.resolve(id, vec![]),
            Err(RuntimeError::UnknownRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_wait_deregisters() {
        let table = PendingRequests::new();
        let read = table.register();
        let id = read.id();

        let waiter = tokio::spawn(read.wait());
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        assert!(!table.contains(id));
    }

    #[tokio::test]
    async fn test_close_all_wakes_waiters() {
        let table = PendingRequests::new();
        let read = table.register();

        table.close_all();

        assert!(matches!(
            read.wait().await,
            Err(RuntimeError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_stale_drop_keeps_newer_slot() {
        let table = PendingRequests::new();
        let old = table.register();
        let id = old.id();
        table.resolve(id, vec![]).unwrap();

        // Force reuse of the id by a newer registration.
        table.inner.next_id.store(id, Ordering::Relaxed);
        let newer = table.register();
        assert_eq!(newer.id(), id);

        drop(old);
        assert!(table.contains(id));
    }
}
