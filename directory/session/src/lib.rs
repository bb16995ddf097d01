//! Client-side session engine for the directory protocol.
//!
//! This crate keeps one logical directory session alive across any number
//! of transport-level connections. It multiplexes requests over a single
//! connection with correlation ids, matches replies strictly in send
//! order, resumes the session after transient outages, and fans out
//! server-pushed watch events to registered listeners from a single
//! dispatcher task.
//!
//! The engine exposes three ways to consume a reply, all backed by the
//! same completion machinery:
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use directory_session::{EngineConfig, SessionEngine, TcpTransport};
//! use directory_wire::OpCode;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = SessionEngine::start(
//!     vec!["127.0.0.1:2380".parse()?],
//!     EngineConfig::default(),
//!     Arc::new(TcpTransport::new()),
//! )?;
//!
//! // Awaited
//! let reply = engine.submit(OpCode::Lookup, Bytes::from_static(b"svcA")).await?;
//!
//! // Future-style: submit now, collect later
//! let pending = engine.submit_future(OpCode::Lookup, Bytes::from_static(b"svcB"));
//! let reply = pending.get().await?;
//!
//! // Fire-and-forget with a callback
//! engine.submit_callback(
//!     OpCode::Register,
//!     Bytes::from_static(b"10.0.0.1:80"),
//!     Arc::new(|outcome, _context| {
//!         if let Err(e) = outcome {
//!             eprintln!("register failed: {e}");
//!         }
//!     }),
//!     None,
//! );
//!
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod error;
mod packet;
mod pending;
pub mod session;
pub mod transport;
pub mod watchers;

pub use config::{EngineConfig, MAX_SESSION_TIMEOUT, MIN_SESSION_TIMEOUT};
pub use dispatcher::{LifecycleEvent, LifecycleListener, SessionEventKind};
pub use error::EngineError;
pub use packet::{ReplyFuture, RequestCallback};
pub use session::{ConnectionStatus, SessionEngine};
pub use transport::{ResponseSink, TcpTransport, Transport, TransportError};
pub use watchers::{WatchListener, WatchRegistration, WatcherRegistry};
