// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the bridge.
//!
//! Engine and reactor failures are handled where they occur; nothing here
//! crosses the public surface except through logs and the `bool` returns of
//! [`crate::Transfer::start`] / [`crate::Transfer::stop`]. A canceled wait is
//! not an error at all — it completes as
//! [`crate::reactor::WaitOutcome::Cancelled`] and is dropped on the floor.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// The engine refused a register/deregister or progress call. The
    /// caller's state is left unchanged.
    #[error("engine rejected the operation")]
    EngineRejected,

    /// The descriptor's socket type or address family cannot be wrapped.
    /// Registration is silently ignored; the engine retries or times out.
    #[error("socket type or address family is not supported")]
    SocketUnsupported,

    /// Operation attempted after the bridge was torn down.
    #[error("bridge has been terminated")]
    Terminated,
}
