// SPDX-License-Identifier: Apache-2.0

//! Per-descriptor watch state.
//!
//! One `SocketWatch` exists per live descriptor the engine asked the bridge
//! to observe. It stays alive while it sits in the bridge's registry and for
//! as long as any in-flight reactor wait holds an `Rc` to it, so a canceled
//! wait always finds the watch it was issued against.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::engine::Action;
use crate::reactor::{Reactor, SocketId};

pub(crate) struct SocketWatch {
    fd: RawFd,
    id: SocketId,
    requested: Cell<Action>,
    removed: Cell<bool>,
}

impl SocketWatch {
    pub(crate) fn new(fd: RawFd, id: SocketId) -> Rc<Self> {
        Rc::new(Self {
            fd,
            id,
            requested: Cell::new(Action::None),
            removed: Cell::new(false),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    pub(crate) fn requested_action(&self) -> Action {
        self.requested.get()
    }

    /// Record the engine's new wish for this descriptor. Outstanding waits
    /// are canceled; the caller re-issues waits for the new action.
    pub(crate) fn set_requested_action(&self, action: Action, reactor: &dyn Reactor) {
        self.requested.set(action);
        reactor.cancel(self.id);
    }

    /// Unlinked from the registry; waits may still drain cancelled
    /// completions but nothing gets re-armed.
    pub(crate) fn mark_removed(&self) {
        self.removed.set(true);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.get()
    }

    /// Whether the descriptor has readable data buffered right now.
    pub(crate) fn data_available(&self, reactor: &dyn Reactor) -> bool {
        reactor.readable_bytes(self.id) > 0
    }
}
