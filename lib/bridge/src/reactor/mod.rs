// SPDX-License-Identifier: Apache-2.0

//! Contract for the event-driven I/O reactor.
//!
//! The reactor provides exactly what the bridge needs and nothing more:
//! cancelable readiness probes on adopted socket descriptors and a single
//! one-shot deadline timer. Waits consume no data; completion means "the
//! descriptor is ready", after which the bridge asks the engine to make
//! progress.
//!
//! Cancellation is synchronous from the caller's point of view: after
//! [`Reactor::cancel`] returns, every outstanding wait for that socket is
//! guaranteed to complete with [`WaitOutcome::Cancelled`] before the objects
//! its callback captured are released, never with [`WaitOutcome::Ready`].

pub mod asyncfd;

use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::BridgeError;

pub use asyncfd::TokioReactor;

/// Reactor-side identity of one adopted (duplicated) descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a readiness wait or timer completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Cancelled,
}

/// Completion callback for a readiness wait or timer. Invoked exactly once,
/// on the event-loop thread.
pub type WaitCallback = Box<dyn FnOnce(WaitOutcome)>;

/// Single-threaded reactor surface. All methods take `&self`; implementations
/// own their interior mutability and must tolerate being reentered from a
/// completion callback they are in the middle of invoking.
pub trait Reactor {
    /// Duplicate `fd`, classify it (stream vs. datagram, v4 vs. v6) and
    /// register the duplicate with the reactor. Unsupported combinations
    /// fail with [`BridgeError::SocketUnsupported`]; the original descriptor
    /// is never touched.
    fn adopt_socket(&self, fd: RawFd) -> Result<SocketId, BridgeError>;

    /// Drop an adopted socket. Outstanding waits complete as cancelled.
    /// Unknown ids are a no-op.
    fn release_socket(&self, id: SocketId);

    /// Probe for readability. `done` fires once the descriptor is readable,
    /// or with [`WaitOutcome::Cancelled`]. Unknown ids complete cancelled.
    fn wait_readable(&self, id: SocketId, done: WaitCallback);

    /// Probe for writability; same contract as [`Reactor::wait_readable`].
    fn wait_writable(&self, id: SocketId, done: WaitCallback);

    /// Cancel all outstanding waits for a socket. Unknown ids are a no-op.
    fn cancel(&self, id: SocketId);

    /// Bytes immediately available for reading on the descriptor, without
    /// consuming them. Returns 0 for unknown ids.
    fn readable_bytes(&self, id: SocketId) -> usize;

    /// Arm the one-shot deadline timer. The caller cancels any previous
    /// deadline first; only one may be pending at a time.
    fn schedule_timer(&self, after: Duration, done: WaitCallback);

    /// Cancel the pending deadline, if any. Its callback completes with
    /// [`WaitOutcome::Cancelled`].
    fn cancel_timer(&self);
}
