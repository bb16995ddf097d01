//! Ordered table of in-flight requests awaiting a reply.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use directory_wire::ReplyHeader;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::packet::Packet;

/// Result of matching a reply against the table head
#[derive(Debug, Default)]
pub(crate) struct MatchOutcome {
    /// Heads trimmed as lost while catching up to the reply's xid,
    /// already settled with [`EngineError::ConnectionLoss`], FIFO order
    pub(crate) lost: Vec<Packet>,
    /// The packet the reply belongs to, already settled
    pub(crate) matched: Option<Packet>,
}

/// FIFO queue of pending requests, ordered by xid assignment.
///
/// One mutex covers append and match-and-remove; callers may hold it
/// across the transport's non-blocking send hand-off but never across
/// actual I/O. Per-packet completion state lives in each packet's own
/// settlement cell, so waiters never contend with table operations.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    queue: Mutex<VecDeque<Packet>>,
    /// Replies older than the current head, dropped silently
    stale_replies: AtomicU64,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `f` with the queue locked. The engine appends and hands the
    /// frame to the transport inside this critical section so send order
    /// always equals table order.
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce(&mut VecDeque<Packet>) -> R) -> R {
        let mut queue = self.queue.lock().expect("pending queue lock poisoned");
        f(&mut queue)
    }

    /// Match a reply against the head of the queue.
    ///
    /// Heads with a smaller xid than the reply were lost in flight: they
    /// are force-completed with CONNECTION_LOSS and popped. A reply with a
    /// smaller xid than the head is stale: it is dropped and the head
    /// requeued. Never blocks on application code.
    pub(crate) fn match_reply(&self, header: ReplyHeader, payload: Bytes) -> MatchOutcome {
        let mut queue = self.queue.lock().expect("pending queue lock poisoned");
        let mut outcome = MatchOutcome::default();

        while let Some(mut head) = queue.pop_front() {
            if head.header.xid == header.xid {
                head.settle_reply(header, payload);
                outcome.matched = Some(head);
                return outcome;
            }

            if head.header.xid < header.xid {
                // Lost-packet recovery: the server skipped this request.
                warn!(
                    lost_xid = head.header.xid,
                    reply_xid = header.xid,
                    "trimming pending request with no reply"
                );
                head.settle_err(EngineError::ConnectionLoss);
                outcome.lost.push(head);
                continue;
            }

            // Stale or duplicate reply: requeue the head, drop the reply.
            queue.push_front(head);
            let seen = self.stale_replies.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(reply_xid = header.xid, stale_replies = seen, "dropping stale reply");
            return outcome;
        }

        debug!(reply_xid = header.xid, "reply with empty pending table");
        outcome
    }

    /// Force-complete every entry in FIFO order with the given error.
    pub(crate) fn drain_all(&self, err: EngineError) -> Vec<Packet> {
        let mut queue = self.queue.lock().expect("pending queue lock poisoned");
        let mut drained = Vec::with_capacity(queue.len());
        while let Some(mut packet) = queue.pop_front() {
            packet.settle_err(err.clone());
            drained.push(packet);
        }
        drained
    }

    /// Number of requests awaiting a reply
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().expect("pending queue lock poisoned").len()
    }

    /// Count of stale replies dropped so far (diagnostic only)
    #[cfg(test)]
    pub(crate) fn stale_reply_count(&self) -> u64 {
        self.stale_replies.load(Ordering::Relaxed)
    }
}
