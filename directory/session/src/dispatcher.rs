//! Single-consumer event dispatcher.
//!
//! Everything application code observes (lifecycle events, watch
//! notifications, request callbacks) flows through one ordered queue
//! drained by one worker task, decoupling listeners from the I/O path.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use directory_wire::WatchPush;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::packet::Packet;
use crate::session::ConnectionStatus;
use crate::watchers::WatcherRegistry;

/// Session lifecycle transitions visible to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    /// A brand-new session was established
    Created,
    /// An existing session was resumed after reconnect
    Reopened,
    /// The session identity was discarded
    Closed,
}

/// Events delivered to lifecycle listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The connection status changed
    StatusChanged {
        /// Status before the transition
        previous: ConnectionStatus,
        /// Status after the transition
        current: ConnectionStatus,
    },
    /// A session-level transition occurred
    Session(SessionEventKind),
}

/// Application listener for lifecycle events
pub trait LifecycleListener: Send + Sync {
    /// Observe one lifecycle event
    fn notify(&self, event: &LifecycleEvent);
}

impl<F> LifecycleListener for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn notify(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Tagged union of everything that travels through the dispatcher queue
pub(crate) enum DispatchEvent {
    /// Lifecycle event for registered listeners
    Lifecycle(LifecycleEvent),
    /// Server-pushed watch event to fan out
    Watch(WatchPush),
    /// A finished request whose callback/registration is still owed
    Finished(Packet),
    /// Poison sentinel: drain what is queued, then stop
    Shutdown,
}

struct DispatchContext {
    registry: Arc<WatcherRegistry>,
    lifecycle: Mutex<Vec<Arc<dyn LifecycleListener>>>,
}

impl DispatchContext {
    fn deliver(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::Lifecycle(event) => {
                let listeners = self.lifecycle.lock().expect("listener lock poisoned").clone();
                for listener in listeners {
                    let guarded = AssertUnwindSafe(|| listener.notify(&event));
                    if std::panic::catch_unwind(guarded).is_err() {
                        error!(?event, "lifecycle listener panicked");
                    }
                }
            }
            DispatchEvent::Watch(push) => {
                for subject_event in push.subjects {
                    let listeners = self
                        .registry
                        .lookup(&subject_event.subject, subject_event.kind);
                    if listeners.is_empty() {
                        debug!(
                            subject = %subject_event.subject,
                            kind = ?subject_event.kind,
                            "watch event with no listeners"
                        );
                        continue;
                    }
                    for change in &subject_event.changes {
                        for listener in &listeners {
                            let guarded = AssertUnwindSafe(|| {
                                listener.process(
                                    &subject_event.subject,
                                    change.op,
                                    &change.payload,
                                )
                            });
                            if std::panic::catch_unwind(guarded).is_err() {
                                error!(
                                    subject = %subject_event.subject,
                                    op = ?change.op,
                                    "watch listener panicked"
                                );
                            }
                        }
                    }
                }
            }
            DispatchEvent::Finished(packet) => {
                let outcome = packet
                    .cell
                    .peek()
                    .unwrap_or(Err(EngineError::Interrupted));

                if let (Some(watch), Ok(_)) = (&packet.watch, &outcome) {
                    self.registry
                        .register(&watch.subject, watch.kind, watch.listener.clone());
                }

                if let Some((callback, context)) = packet.callback {
                    let guarded =
                        AssertUnwindSafe(|| callback.call(outcome.clone(), context.clone()));
                    if std::panic::catch_unwind(guarded).is_err() {
                        error!(xid = packet.header.xid, "request callback panicked");
                    }
                }
            }
            DispatchEvent::Shutdown => {}
        }
    }
}

/// Ordered fan-out of completions, watch notifications, and lifecycle
/// events on one dedicated task.
pub(crate) struct EventDispatcher {
    tx: mpsc::UnboundedSender<DispatchEvent>,
    stopped: Arc<AtomicBool>,
    ctx: Arc<DispatchContext>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventDispatcher {
    pub(crate) fn start(registry: Arc<WatcherRegistry>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchEvent>();
        let ctx = Arc::new(DispatchContext {
            registry,
            lifecycle: Mutex::new(Vec::new()),
        });
        let stopped = Arc::new(AtomicBool::new(false));

        let worker_ctx = Arc::clone(&ctx);
        let worker_stopped = Arc::clone(&stopped);
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, DispatchEvent::Shutdown) {
                    // Close the channel before draining: a producer racing
                    // the stop flag gets a send error and delivers
                    // synchronously, so nothing can sit in a dropped queue.
                    rx.close();
                    worker_stopped.store(true, Ordering::SeqCst);
                    while let Ok(event) = rx.try_recv() {
                        worker_ctx.deliver(event);
                    }
                    break;
                }
                worker_ctx.deliver(event);
            }
            worker_stopped.store(true, Ordering::SeqCst);
            info!("event dispatcher stopped");
        });

        Self {
            tx,
            stopped,
            ctx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a lifecycle listener
    pub(crate) fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.ctx
            .lifecycle
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Enqueue an event; non-blocking from any thread. Once the worker
    /// has stopped, delivery happens synchronously on the caller so no
    /// event is silently lost.
    pub(crate) fn emit(&self, event: DispatchEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            self.ctx.deliver(event);
            return;
        }
        if let Err(err) = self.tx.send(event) {
            self.ctx.deliver(err.0);
        }
    }

    /// Send the poison sentinel and wait for the queue to drain.
    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(DispatchEvent::Shutdown);
        let worker = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use directory_wire::{
        ChangeOp, ErrorCode, InstanceChange, OpCode, ReplyHeader, RequestHeader, SubjectEvent,
        WatchKind,
    };
    use std::sync::atomic::AtomicUsize;

    use crate::watchers::{WatchListener, WatchRegistration};

    struct Recorder(Mutex<Vec<(String, ChangeOp)>>);

    impl WatchListener for Recorder {
        fn process(&self, subject: &str, op: ChangeOp, _payload: &[u8]) {
            self.0.lock().unwrap().push((subject.to_string(), op));
        }
    }

    fn three_change_push() -> WatchPush {
        WatchPush {
            subjects: vec![SubjectEvent {
                subject: "svcA".to_string(),
                kind: WatchKind::Service,
                changes: vec![
                    InstanceChange {
                        op: ChangeOp::Add,
                        payload: Bytes::from_static(b"a"),
                    },
                    InstanceChange {
                        op: ChangeOp::Update,
                        payload: Bytes::from_static(b"b"),
                    },
                    InstanceChange {
                        op: ChangeOp::Delete,
                        payload: Bytes::from_static(b"c"),
                    },
                ],
            }],
        }
    }

    #[tokio::test]
    async fn test_watch_fanout_in_source_order() {
        let registry = Arc::new(WatcherRegistry::new());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        registry.register("svcA", WatchKind::Service, recorder.clone());

        let dispatcher = EventDispatcher::start(registry);
        dispatcher.emit(DispatchEvent::Watch(three_change_push()));
        dispatcher.shutdown().await;

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("svcA".to_string(), ChangeOp::Add),
                ("svcA".to_string(), ChangeOp::Update),
                ("svcA".to_string(), ChangeOp::Delete),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        struct Panicker;
        impl WatchListener for Panicker {
            fn process(&self, _subject: &str, _op: ChangeOp, _payload: &[u8]) {
                panic!("boom");
            }
        }

        let registry = Arc::new(WatcherRegistry::new());
        registry.register("svcA", WatchKind::Service, Arc::new(Panicker));
        let counter = Arc::new(AtomicUsize::new(0));
        let counting = {
            let counter = Arc::clone(&counter);
            Arc::new(move |_: &str, _: ChangeOp, _: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        registry.register("svcA", WatchKind::Service, counting);

        let dispatcher = EventDispatcher::start(registry);
        dispatcher.emit(DispatchEvent::Watch(three_change_push()));
        dispatcher.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_finished_packet_registers_watch_on_ok_only() {
        let registry = Arc::new(WatcherRegistry::new());
        let dispatcher = EventDispatcher::start(Arc::clone(&registry));

        let listener: Arc<dyn WatchListener> =
            Arc::new(Recorder(Mutex::new(Vec::new())));
        let registration = WatchRegistration {
            subject: "svcA".to_string(),
            kind: WatchKind::Service,
            listener: listener.clone(),
        };

        let mut failed = Packet::new(RequestHeader::new(OpCode::WatchService), Bytes::new());
        failed.watch = Some(registration.clone());
        failed.settle_reply(
            ReplyHeader::new(1, 0, ErrorCode::ConnectionLoss),
            Bytes::new(),
        );
        dispatcher.emit(DispatchEvent::Finished(failed));

        let mut succeeded = Packet::new(RequestHeader::new(OpCode::WatchService), Bytes::new());
        succeeded.watch = Some(registration);
        succeeded.settle_reply(ReplyHeader::new(2, 5, ErrorCode::Ok), Bytes::new());
        dispatcher.emit(DispatchEvent::Finished(succeeded));

        dispatcher.shutdown().await;
        assert_eq!(registry.lookup("svcA", WatchKind::Service).len(), 1);
    }

    #[tokio::test]
    async fn test_events_queued_behind_sentinel_still_delivered() {
        let registry = Arc::new(WatcherRegistry::new());
        let dispatcher = EventDispatcher::start(Arc::clone(&registry));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = Arc::clone(&seen);
            Arc::new(move |event: &LifecycleEvent| {
                seen.lock().unwrap().push(*event);
            })
        };
        dispatcher.add_lifecycle_listener(listener);

        // The worker has not run yet on a current-thread runtime, so both
        // the sentinel and the trailing event are queued before the drain.
        let _ = dispatcher.tx.send(DispatchEvent::Shutdown);
        dispatcher.emit(DispatchEvent::Lifecycle(LifecycleEvent::Session(
            SessionEventKind::Created,
        )));
        dispatcher.shutdown().await;

        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![LifecycleEvent::Session(SessionEventKind::Created)]
        );
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_delivers_synchronously() {
        let registry = Arc::new(WatcherRegistry::new());
        let dispatcher = EventDispatcher::start(Arc::clone(&registry));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = Arc::clone(&seen);
            Arc::new(move |event: &LifecycleEvent| {
                seen.lock().unwrap().push(*event);
            })
        };
        dispatcher.add_lifecycle_listener(listener);

        dispatcher.emit(DispatchEvent::Lifecycle(LifecycleEvent::Session(
            SessionEventKind::Created,
        )));
        dispatcher.shutdown().await;

        // Late producer: the worker is gone, delivery happens inline.
        dispatcher.emit(DispatchEvent::Lifecycle(LifecycleEvent::Session(
            SessionEventKind::Closed,
        )));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                LifecycleEvent::Session(SessionEventKind::Created),
                LifecycleEvent::Session(SessionEventKind::Closed),
            ]
        );
    }
}
