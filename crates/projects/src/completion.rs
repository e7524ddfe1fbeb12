//! Pending-completion table: resolves a waiter when the backend publishes the
//! event that finishes its request.
//!
//! Register before issuing the request, so a completion that arrives before
//! the caller starts waiting is not lost:
//!
//! ```ignore
//! let pending = table.register_op(EventKind::MoveBulkComplete, op_id);
//! backend.move_bulk(op_id, ...).await?;
//! let event = pending.wait(timeout).await?;
//! ```

use std::{
    cell::{Cell, RefCell},
    time::Duration,
};

use {tokio::sync::oneshot, tracing::debug};

use crate::{
    error::{Error, Result},
    events::{EventKind, OperationId, ServerEvent},
};

type Matcher = Box<dyn Fn(&ServerEvent) -> bool>;

struct Waiter {
    id: u64,
    kind: EventKind,
    matcher: Matcher,
    sender: oneshot::Sender<ServerEvent>,
}

#[derive(Default)]
pub struct CompletionTable {
    next_id: Cell<u64>,
    waiters: RefCell<Vec<Waiter>>,
}

impl CompletionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next `kind` event accepted by `matcher`.
    pub fn register(
        &self,
        kind: EventKind,
        matcher: impl Fn(&ServerEvent) -> bool + 'static,
    ) -> Pending<'_> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let (sender, receiver) = oneshot::channel();
        self.waiters.borrow_mut().push(Waiter {
            id,
            kind,
            matcher: Box::new(matcher),
            sender,
        });
        Pending {
            table: self,
            id,
            kind,
            receiver: Some(receiver),
        }
    }

    /// Wait for the `kind` event carrying `op_id`.
    pub fn register_op(&self, kind: EventKind, op_id: OperationId) -> Pending<'_> {
        self.register(kind, move |event| event.op_id() == Some(op_id))
    }

    /// Register and wait in one step.
    pub async fn await_completion(
        &self,
        kind: EventKind,
        matcher: impl Fn(&ServerEvent) -> bool + 'static,
        timeout: Duration,
    ) -> Result<ServerEvent> {
        self.register(kind, matcher).wait(timeout).await
    }

    /// Offer an event to the waiters, oldest first. Every matching waiter
    /// fires once and leaves the table. Returns how many fired.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        let matched: Vec<Waiter> = {
            let mut waiters = self.waiters.borrow_mut();
            let (matched, rest): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| w.kind == kind && (w.matcher)(event));
            *waiters = rest;
            matched
        };
        let fired = matched.len();
        for waiter in matched {
            // The receiver may have timed out and dropped already.
            let _ = waiter.sender.send(event.clone());
        }
        if fired == 0 {
            debug!(%kind, "no waiter for event");
        }
        fired
    }

    /// Number of waiters still registered.
    pub fn pending(&self) -> usize {
        self.waiters.borrow().len()
    }

    fn remove(&self, id: u64) {
        self.waiters.borrow_mut().retain(|w| w.id != id);
    }
}

/// A registered waiter. Dropping it unregisters it.
pub struct Pending<'a> {
    table: &'a CompletionTable,
    id: u64,
    kind: EventKind,
    receiver: Option<oneshot::Receiver<ServerEvent>>,
}

impl Pending<'_> {
    pub async fn wait(mut self, timeout: Duration) -> Result<ServerEvent> {
        let Some(receiver) = self.receiver.take() else {
            return Err(Error::ChannelClosed { kind: self.kind });
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(Error::ChannelClosed { kind: self.kind }),
            Err(_) => Err(Error::CompletionTimeout {
                kind: self.kind,
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::path::PathBuf};

    fn deletion(op_id: OperationId) -> ServerEvent {
        ServerEvent::DeletionComplete {
            op_id,
            path: PathBuf::from("/p/app"),
            success: true,
            error: None,
        }
    }

    #[tokio::test]
    async fn resolves_on_matching_event() {
        let table = CompletionTable::new();
        let op_id = OperationId::new();
        let pending = table.register_op(EventKind::DeletionComplete, op_id);

        assert_eq!(table.dispatch(&deletion(OperationId::new())), 0);
        assert_eq!(table.dispatch(&deletion(op_id)), 1);
        assert_eq!(table.pending(), 0);

        let event = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.op_id(), Some(op_id));
    }

    #[tokio::test]
    async fn event_before_wait_is_kept() {
        let table = CompletionTable::new();
        let op_id = OperationId::new();
        let pending = table.register_op(EventKind::DeletionComplete, op_id);
        table.dispatch(&deletion(op_id));
        assert!(pending.wait(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn fires_only_once() {
        let table = CompletionTable::new();
        let op_id = OperationId::new();
        let _pending = table.register_op(EventKind::DeletionComplete, op_id);
        assert_eq!(table.dispatch(&deletion(op_id)), 1);
        assert_eq!(table.dispatch(&deletion(op_id)), 0);
    }

    #[tokio::test]
    async fn kind_must_match() {
        let table = CompletionTable::new();
        let _pending = table.register(EventKind::MoveBulkComplete, |_| true);
        assert_eq!(table.dispatch(&deletion(OperationId::new())), 0);
        assert_eq!(table.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_unregisters() {
        let table = CompletionTable::new();
        let err = table
            .await_completion(EventKind::DeletionComplete, |_| true, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CompletionTimeout {
            kind: EventKind::DeletionComplete,
            waited_ms: 5000
        }));
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn dropping_pending_unregisters() {
        let table = CompletionTable::new();
        drop(table.register(EventKind::FolderPicked, |_| true));
        assert_eq!(table.pending(), 0);
    }
}
