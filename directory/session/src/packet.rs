//! Pending requests and their completion primitives.
//!
//! Every submitted request is tracked as a [`Packet`] whose outcome lands
//! in exactly one [`Settlement`] cell. The three calling conventions the
//! engine offers (awaited submit, [`ReplyFuture`], fire-and-forget
//! callback) are thin adapters over that single cell, so the matching and
//! trim logic stays single-sourced.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use directory_wire::{ReplyHeader, RequestHeader};
use tokio::sync::Notify;

use crate::error::EngineError;
use crate::watchers::WatchRegistration;

/// One-shot settlement cell: first completion wins, all waiters wake.
#[derive(Debug, Default)]
pub(crate) struct Settlement {
    outcome: Mutex<Option<Result<Bytes, EngineError>>>,
    notify: Notify,
}

impl Settlement {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Complete with a payload. Returns false if already settled.
    pub(crate) fn complete(&self, payload: Bytes) -> bool {
        self.settle(Ok(payload))
    }

    /// Complete with an error. Returns false if already settled.
    pub(crate) fn fail(&self, err: EngineError) -> bool {
        self.settle(Err(err))
    }

    fn settle(&self, result: Result<Bytes, EngineError>) -> bool {
        let mut outcome = self.outcome.lock().expect("settlement lock poisoned");
        if outcome.is_some() {
            return false;
        }
        *outcome = Some(result);
        drop(outcome);
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.outcome
            .lock()
            .expect("settlement lock poisoned")
            .is_some()
    }

    /// Snapshot of the outcome, if settled.
    pub(crate) fn peek(&self) -> Option<Result<Bytes, EngineError>> {
        self.outcome
            .lock()
            .expect("settlement lock poisoned")
            .clone()
    }

    /// Suspend until the cell settles.
    pub(crate) async fn wait(&self) -> Result<Bytes, EngineError> {
        loop {
            // Register interest before checking, so a settle between the
            // check and the await still wakes us.
            let notified = self.notify.notified();
            if let Some(result) = self.peek() {
                return result;
            }
            notified.await;
        }
    }

    /// Bounded wait. Expiry raises [`EngineError::WaitTimeout`] without
    /// touching the cell; the request may still settle later.
    pub(crate) async fn wait_timeout(&self, limit: Duration) -> Result<Bytes, EngineError> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::WaitTimeout),
        }
    }
}

/// Cancellable handle to a request's eventual reply
#[derive(Debug, Clone)]
pub struct ReplyFuture {
    cell: Arc<Settlement>,
}

impl ReplyFuture {
    pub(crate) fn new(cell: Arc<Settlement>) -> Self {
        Self { cell }
    }

    /// Wait for the reply
    pub async fn get(&self) -> Result<Bytes, EngineError> {
        self.cell.wait().await
    }

    /// Wait for the reply with a deadline.
    ///
    /// Raises [`EngineError::WaitTimeout`] on expiry; the underlying
    /// request is unaffected and is simply never observed through this
    /// call.
    pub async fn get_timeout(&self, limit: Duration) -> Result<Bytes, EngineError> {
        self.cell.wait_timeout(limit).await
    }

    /// Best-effort cancellation.
    ///
    /// Marks the future completed so a late reply is discarded; an
    /// already-finished future cannot be cancelled. The in-flight send, if
    /// any, is not aborted.
    pub fn cancel(&self) -> bool {
        self.cell.fail(EngineError::Interrupted)
    }

    /// Whether the future has settled
    pub fn is_finished(&self) -> bool {
        self.cell.is_finished()
    }
}

/// Fire-and-forget completion callback.
///
/// Invoked exactly once from the event dispatcher with the request's
/// outcome and the caller-supplied context.
pub trait RequestCallback: Send + Sync {
    /// Deliver the outcome of a request
    fn call(&self, outcome: Result<Bytes, EngineError>, context: Option<Bytes>);
}

impl<F> RequestCallback for F
where
    F: Fn(Result<Bytes, EngineError>, Option<Bytes>) + Send + Sync,
{
    fn call(&self, outcome: Result<Bytes, EngineError>, context: Option<Bytes>) {
        self(outcome, context)
    }
}

/// A request in flight: owned by the pending table until matched or
/// force-completed, then by the dispatcher queue until delivered.
pub(crate) struct Packet {
    /// Request header; xid is filled in at send time
    pub(crate) header: RequestHeader,
    /// Request payload
    pub(crate) payload: Bytes,
    /// Reply header, once matched
    pub(crate) reply: Option<ReplyHeader>,
    /// Settlement cell all three calling conventions observe
    pub(crate) cell: Arc<Settlement>,
    /// Callback plus caller context, for the callback convention
    pub(crate) callback: Option<(Arc<dyn RequestCallback>, Option<Bytes>)>,
    /// Watch to register when the request completes with Ok
    pub(crate) watch: Option<WatchRegistration>,
}

impl Packet {
    pub(crate) fn new(header: RequestHeader, payload: Bytes) -> Self {
        Self {
            header,
            payload,
            reply: None,
            cell: Settlement::new(),
            callback: None,
            watch: None,
        }
    }

    /// Settle from a matched reply: Ok payload on success, the mapped
    /// engine error otherwise.
    pub(crate) fn settle_reply(&mut self, header: ReplyHeader, payload: Bytes) {
        self.reply = Some(header);
        if header.err.is_ok() {
            self.cell.complete(payload);
        } else {
            self.cell.fail(EngineError::from_code(header.err));
        }
    }

    /// Force-complete with an engine error (drain, trim, failed send).
    pub(crate) fn settle_err(&mut self, err: EngineError) {
        self.cell.fail(err);
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("reply", &self.reply)
            .field("finished", &self.cell.is_finished())
            .field("has_callback", &self.callback.is_some())
            .field("has_watch", &self.watch.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directory_wire::{ErrorCode, OpCode};

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let cell = Settlement::new();
        assert!(cell.complete(Bytes::from_static(b"first")));
        assert!(!cell.complete(Bytes::from_static(b"second")));
        assert!(!cell.fail(EngineError::ConnectionLoss));

        assert_eq!(cell.wait().await.unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_settle() {
        let cell = Settlement::new();
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };
        tokio::task::yield_now().await;

        cell.fail(EngineError::SessionExpired);
        assert_eq!(
            waiter.await.unwrap(),
            Err(EngineError::SessionExpired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_has_no_side_effect() {
        let cell = Settlement::new();
        let result = cell.wait_timeout(Duration::from_millis(50)).await;
        assert_eq!(result, Err(EngineError::WaitTimeout));
        assert!(!cell.is_finished());

        // A later completion is still observable.
        cell.complete(Bytes::from_static(b"late"));
        assert_eq!(cell.wait().await.unwrap(), Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn test_cancelled_future_ignores_late_reply() {
        let cell = Settlement::new();
        let future = ReplyFuture::new(cell.clone());

        assert!(future.cancel());
        assert!(!cell.complete(Bytes::from_static(b"late")));
        assert_eq!(future.get().await, Err(EngineError::Interrupted));

        // A finished future cannot be cancelled again.
        assert!(!future.cancel());
    }

    #[test]
    fn test_settle_reply_maps_error_codes() {
        let mut packet = Packet::new(RequestHeader::new(OpCode::Lookup), Bytes::new());
        packet.settle_reply(
            ReplyHeader::new(1, 10, ErrorCode::SessionExpired),
            Bytes::new(),
        );
        assert_eq!(packet.cell.peek(), Some(Err(EngineError::SessionExpired)));

        let mut packet = Packet::new(RequestHeader::new(OpCode::Lookup), Bytes::new());
        packet.settle_reply(
            ReplyHeader::new(2, 11, ErrorCode::Other(-42)),
            Bytes::new(),
        );
        assert_eq!(
            packet.cell.peek(),
            Some(Err(EngineError::Remote(ErrorCode::Other(-42))))
        );
    }
}
