// SPDX-License-Identifier: Apache-2.0

//! Contract for the external transfer engine.
//!
//! The engine owns all transport and protocol logic but performs no I/O of
//! its own: it tells the bridge which descriptors to watch (via
//! [`EngineCallbacks::on_socket_action`]) and when its next deadline elapses
//! (via [`EngineCallbacks::on_timer_change`]), and the bridge calls back into
//! it with [`Engine::process_readiness`] / [`Engine::process_timeout`] when
//! the reactor reports that a wait completed.
//!
//! Everything here runs on one event-loop thread. Trait methods take `&self`
//! and implementations own their interior mutability; engine-originated
//! callbacks may reenter the bridge synchronously from within `register`,
//! `process_readiness` and `process_timeout`.

use std::fmt;
use std::os::fd::RawFd;
use std::rc::Weak;

use bytes::Bytes;

use crate::error::BridgeError;

/// Identifies one transfer inside the engine. Exclusively owned by the
/// [`crate::Transfer`] it was created for; released when that transfer is
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u64);

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the engine's multiplexer instance. One per [`crate::Bridge`],
/// created at construction and released exactly once when the bridge is
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MultiHandle(pub u64);

impl fmt::Display for MultiHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the engine currently wants watched on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Read,
    Write,
    Both,
    /// Stop watching the descriptor and forget its slot association.
    Remove,
}

impl Action {
    pub fn wants_read(self) -> bool {
        matches!(self, Action::Read | Action::Both)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, Action::Write | Action::Both)
    }
}

/// Result code the engine reports for a finished transfer. The code space is
/// owned by the engine; the bridge only forwards it to the transfer's
/// completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(0);

    pub fn is_ok(self) -> bool {
        self == ResultCode::OK
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Answer the bridge gives the engine for one delivered chunk of data.
///
/// Consuming fewer bytes than were delivered is how the bridge tells the
/// engine to fail the transfer with a write error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This many bytes of the chunk were accepted.
    Consumed(usize),
    /// Suspend delivery; the engine resumes on demand.
    Pause,
}

/// The multi-transfer engine, behind which all transport and protocol logic
/// lives (connection setup, TLS, parsing). See the module docs for the
/// calling discipline.
pub trait Engine {
    /// Create the multiplexer and install the callback sink. The engine must
    /// not invoke any callback from inside this call: the sink cannot be
    /// upgraded until construction of its owner finishes.
    fn create_multi(&self, callbacks: Weak<dyn EngineCallbacks>) -> MultiHandle;

    /// Release the multiplexer. Called exactly once, after termination.
    fn release_multi(&self, multi: MultiHandle);

    /// Allocate a transfer handle, or `None` if the engine cannot.
    fn create_handle(&self) -> Option<EngineHandle>;

    /// Return a previously used handle to its freshly created state.
    fn reset_handle(&self, handle: EngineHandle);

    /// Release a transfer handle for good.
    fn release_handle(&self, handle: EngineHandle);

    /// Set the target (URL or engine-specific address) for the next run.
    fn set_target(&self, handle: EngineHandle, target: &str);

    /// Hand a transfer to the multiplexer. May synchronously invoke the
    /// registered callbacks (typically a timer change).
    fn register(&self, multi: MultiHandle, handle: EngineHandle) -> Result<(), BridgeError>;

    /// Take a transfer back from the multiplexer.
    fn deregister(&self, multi: MultiHandle, handle: EngineHandle) -> Result<(), BridgeError>;

    /// Associate (or clear) the bridge's per-socket slot for a descriptor.
    /// Subsequent `on_socket_action` calls for `fd` are relative to this
    /// association; the bridge keys its own registry by descriptor.
    fn assign_slot(&self, multi: MultiHandle, fd: RawFd, associated: bool);

    /// Let the engine act on readiness of `fd` in direction `action`.
    /// Returns the number of transfers still in flight. May synchronously
    /// invoke any of the registered callbacks.
    fn process_readiness(
        &self,
        multi: MultiHandle,
        fd: RawFd,
        action: Action,
    ) -> Result<usize, BridgeError>;

    /// Let the engine act on an expired deadline ("timeout, no specific
    /// socket"). Returns the number of transfers still in flight.
    fn process_timeout(&self, multi: MultiHandle) -> Result<usize, BridgeError>;

    /// Pull the next finished-transfer notification, if any.
    fn poll_completed(&self, multi: MultiHandle) -> Option<(EngineHandle, ResultCode)>;
}

/// Callback sink the bridge installs on the engine at
/// [`Engine::create_multi`] time.
pub trait EngineCallbacks {
    /// The engine wants to start, change, or stop watching `fd`.
    /// Returns 0 on success, matching the engine-side callback contract.
    fn on_socket_action(&self, fd: RawFd, action: Action) -> i32;

    /// The engine's next deadline changed. A non-positive `timeout_ms` means
    /// the deadline is already due.
    fn on_timer_change(&self, timeout_ms: i64) -> i32;

    /// The engine delivers a chunk of received data for a transfer.
    fn on_data(&self, handle: EngineHandle, chunk: Bytes) -> WriteOutcome;
}
