// SPDX-License-Identifier: Apache-2.0

//! One unit of work handed to the engine.
//!
//! A [`Transfer`] is created by [`crate::Bridge::create_transfer`] and owned
//! by the caller. While it is registered with the engine the bridge holds a
//! second `Rc` to it in its active-transfer table, so the transfer survives
//! even if the caller drops theirs mid-run; that entry is the "self-lock" of
//! the lifecycle model.
//!
//! State machine: Idle → Running on a successful [`Transfer::start`], back to
//! Idle when the completion drain fires [`TransferInner::finish`] or on a
//! synchronous [`Transfer::stop`]. A `stop` issued from inside the data
//! callback only clears the running flag; the engine handle is physically
//! deregistered after the bridge's own call into the engine unwinds.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::bridge::BridgeCore;
use crate::engine::{EngineHandle, ResultCode, WriteOutcome};

/// What the data callback wants done with a delivered chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAction {
    /// Accept the chunk, keep the data coming.
    Accept,
    /// Suspend delivery until the engine resumes the transfer.
    Pause,
    /// Refuse the chunk; the engine fails the transfer with a write error.
    Abort,
}

pub(crate) type DataFn = Box<dyn FnMut(Bytes) -> DataAction>;
pub(crate) type DoneFn = Box<dyn FnMut(ResultCode)>;

pub(crate) struct TransferInner {
    bridge: Weak<BridgeCore>,
    handle: Cell<Option<EngineHandle>>,
    running: Cell<bool>,
    detached: Cell<bool>,
    on_data: RefCell<Option<DataFn>>,
    on_done: RefCell<Option<DoneFn>>,
}

/// Caller-facing transfer handle.
pub struct Transfer {
    inner: Rc<TransferInner>,
}

impl Transfer {
    pub(crate) fn new(bridge: Weak<BridgeCore>) -> Self {
        Self {
            inner: Rc::new(TransferInner {
                bridge,
                handle: Cell::new(None),
                running: Cell::new(false),
                detached: Cell::new(false),
                on_data: RefCell::new(None),
                on_done: RefCell::new(None),
            }),
        }
    }

    /// Install the data-delivery callback. Without one, all delivered bytes
    /// are accepted.
    pub fn on_data(&self, f: impl FnMut(Bytes) -> DataAction + 'static) {
        *self.inner.on_data.borrow_mut() = Some(Box::new(f));
    }

    /// Install the completion callback, invoked exactly once per registered
    /// run with the engine's result code.
    pub fn on_done(&self, f: impl FnMut(ResultCode) + 'static) {
        *self.inner.on_done.borrow_mut() = Some(Box::new(f));
    }

    /// Register the transfer with the engine and begin the run.
    ///
    /// Returns `false` with no state change if the transfer is already
    /// running, the bridge is gone or terminated, the engine refuses the
    /// handle, or we are inside an engine callback stack (the engine's
    /// transfer set must not be mutated while it is being iterated).
    pub fn start(&self, target: &str) -> bool {
        let inner = &self.inner;
        if inner.running.get() || inner.detached.get() {
            return false;
        }
        let Some(core) = inner.bridge.upgrade() else {
            return false;
        };
        if core.is_terminated() || core.depth() > 0 {
            return false;
        }

        let handle = match inner.handle.get() {
            Some(handle) => {
                core.engine().reset_handle(handle);
                handle
            }
            None => {
                let Some(handle) = core.engine().create_handle() else {
                    return false;
                };
                inner.handle.set(Some(handle));
                handle
            }
        };
        core.engine().set_target(handle, target);

        if core.register_transfer(handle, inner.clone()) {
            inner.running.set(true);
            debug!(%handle, target, "transfer started");
            true
        } else {
            false
        }
    }

    /// Stop a running transfer. From inside an engine callback the stop is
    /// deferred: `running()` flips to `false` immediately (further data
    /// deliveries are refused) and the handle is deregistered once the
    /// callback stack unwinds. No completion callback fires for a
    /// synchronous stop.
    pub fn stop(&self) -> bool {
        let inner = &self.inner;
        if !inner.running.get() || inner.detached.get() {
            return false;
        }
        let Some(core) = inner.bridge.upgrade() else {
            return false;
        };
        let Some(handle) = inner.handle.get() else {
            return false;
        };

        if core.depth() > 0 {
            inner.running.set(false);
            core.defer_stop(handle);
            trace!(%handle, "stop deferred until engine call unwinds");
            return true;
        }

        if core.deregister_transfer(handle) {
            inner.running.set(false);
            debug!(%handle, "transfer stopped");
            true
        } else {
            false
        }
    }

    pub fn running(&self) -> bool {
        self.inner.running.get()
    }
}

impl TransferInner {
    /// Data-delivery trampoline, reached from the engine via
    /// [`crate::engine::EngineCallbacks::on_data`]. The caller already holds
    /// the bridge's depth guard.
    pub(crate) fn deliver(&self, chunk: Bytes) -> WriteOutcome {
        let len = chunk.len();
        let Some(mut callback) = self.on_data.borrow_mut().take() else {
            return WriteOutcome::Consumed(len);
        };
        let action = callback(chunk);
        // Reinstall unless the callback replaced itself.
        if self.on_data.borrow().is_none() {
            *self.on_data.borrow_mut() = Some(callback);
        }

        // A reentrant stop() already cleared the flag; short-circuit
        // delivery no matter what the callback answered.
        if !self.running.get() {
            return WriteOutcome::Consumed(0);
        }

        match action {
            DataAction::Accept => WriteOutcome::Consumed(len),
            DataAction::Pause => WriteOutcome::Pause,
            DataAction::Abort => WriteOutcome::Consumed(0),
        }
    }

    /// Completion notification, fired by the bridge's drain exactly once per
    /// registered run.
    pub(crate) fn finish(&self, code: ResultCode) {
        debug!(%code, "transfer finished");
        let callback = self.on_done.borrow_mut().take();
        if let Some(mut callback) = callback {
            callback(code);
            if self.on_done.borrow().is_none() {
                *self.on_done.borrow_mut() = Some(callback);
            }
        }
        self.running.set(false);
    }

    /// Cut the transfer loose at bridge termination: no completion fires and
    /// start/stop refuse from here on.
    pub(crate) fn detach(&self) {
        self.detached.set(true);
    }
}

impl Drop for TransferInner {
    fn drop(&mut self) {
        if let (Some(core), Some(handle)) = (self.bridge.upgrade(), self.handle.get()) {
            core.engine().release_handle(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::bridge::Bridge;
    use crate::testing::{EngineOp, MockEngine, MockReactor};

    fn setup() -> (MockEngine, MockReactor, Bridge) {
        let engine = MockEngine::new();
        let reactor = MockReactor::new();
        let bridge = Bridge::new(Box::new(engine.clone()), Box::new(reactor.clone()));
        (engine, reactor, bridge)
    }

    #[test]
    fn start_refuses_while_running() {
        let (engine, _reactor, bridge) = setup();
        let transfer = bridge.create_transfer();
        assert!(transfer.start("tcp://peer:9"));
        assert!(transfer.running());
        assert!(!transfer.start("tcp://peer:9"));
        assert_eq!(engine.target(engine.last_handle()).as_deref(), Some("tcp://peer:9"));
    }

    #[test]
    fn start_refuses_when_bridge_is_gone() {
        let (_engine, _reactor, bridge) = setup();
        let transfer = bridge.create_transfer();
        drop(bridge);
        assert!(!transfer.start("tcp://peer:9"));
        assert!(!transfer.running());
    }

    #[test]
    fn start_leaves_state_unchanged_when_engine_refuses() {
        let (engine, _reactor, bridge) = setup();
        let transfer = bridge.create_transfer();
        engine.fail_next_register();
        assert!(!transfer.start("tcp://peer:9"));
        assert!(!transfer.running());
        // The handle survives the refusal and is reused on the next attempt.
        assert!(transfer.start("tcp://peer:9"));
        assert!(engine.is_registered(engine.last_handle()));
    }

    #[test]
    fn synchronous_stop_deregisters_without_completion() {
        let (engine, _reactor, bridge) = setup();
        let transfer = bridge.create_transfer();
        let completions = Rc::new(Cell::new(0u32));
        let seen = completions.clone();
        transfer.on_done(move |_| seen.set(seen.get() + 1));

        assert!(transfer.start("tcp://peer:9"));
        let handle = engine.last_handle();
        assert!(transfer.stop());
        assert!(!transfer.running());
        assert_eq!(engine.deregistered(), vec![handle]);
        assert_eq!(completions.get(), 0);
        assert!(!transfer.stop());
    }

    #[test]
    fn restart_reuses_the_engine_handle() {
        let (engine, _reactor, bridge) = setup();
        let transfer = bridge.create_transfer();
        assert!(transfer.start("tcp://first:1"));
        let handle = engine.last_handle();
        assert!(transfer.stop());

        assert!(transfer.start("tcp://second:2"));
        assert_eq!(engine.last_handle(), handle);
        assert_eq!(engine.target(handle).as_deref(), Some("tcp://second:2"));
    }

    #[test]
    fn completion_fires_exactly_once_even_if_deregistration_fails() {
        let (engine, reactor, bridge) = setup();
        let transfer = bridge.create_transfer();
        let completions = Rc::new(Cell::new(0u32));
        let seen = completions.clone();
        transfer.on_done(move |code| {
            assert!(code.is_ok());
            seen.set(seen.get() + 1);
        });

        engine.on_register(vec![EngineOp::TimerChange(50)]);
        assert!(transfer.start("tcp://peer:9"));
        let handle = engine.last_handle();

        engine.fail_next_deregister();
        engine.on_progress(vec![
            EngineOp::Complete(handle, crate::engine::ResultCode::OK),
            EngineOp::Return(0),
        ]);
        assert!(reactor.fire_timer());

        // Finalized locally despite the engine's refusal.
        assert_eq!(completions.get(), 1);
        assert!(!transfer.running());
    }

    #[test]
    fn dropping_the_last_reference_releases_the_handle() {
        let (engine, _reactor, bridge) = setup();
        let transfer = bridge.create_transfer();
        assert!(transfer.start("tcp://peer:9"));
        let handle = engine.last_handle();
        assert!(transfer.stop());
        drop(transfer);
        assert!(!engine.handle_exists(handle));
    }
}
