// SPDX-License-Identifier: Apache-2.0

//! Towline bridges a multi-transfer data-movement engine — one that manages
//! many concurrent transfers through a socket-readiness callback protocol —
//! onto a single-threaded, event-driven reactor.
//!
//! The engine performs no I/O itself: it announces which descriptors it
//! wants watched and when its next deadline elapses; the [`Bridge`] performs
//! the non-blocking waits and, when the reactor reports readiness or a
//! timeout, asks the engine to make progress. All of it runs cooperatively
//! on one thread, so there are no locks anywhere — the interesting work is
//! keeping engine handles, socket watches and in-flight reactor waits
//! consistent under removal races and under reentrant mutation from within
//! the engine's own callback stack.
//!
//! The engine and the reactor are collaborators behind the [`Engine`] and
//! [`Reactor`] traits; a tokio-backed reactor ships as
//! [`reactor::TokioReactor`] and deterministic doubles live in [`testing`].

#![allow(dead_code)]

pub use anyhow::{Error, Result};

pub mod bridge;
pub mod engine;
pub mod error;
pub mod logging;
pub mod reactor;
mod socket;
pub mod testing;
pub mod transfer;

pub use bridge::Bridge;
pub use engine::{
    Action, Engine, EngineCallbacks, EngineHandle, MultiHandle, ResultCode, WriteOutcome,
};
pub use error::BridgeError;
pub use reactor::{Reactor, SocketId, TokioReactor, WaitOutcome};
pub use transfer::{DataAction, Transfer};
