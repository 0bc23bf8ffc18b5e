// SPDX-License-Identifier: Apache-2.0

//! The adapter that drives the engine from the reactor.
//!
//! [`Bridge`] owns the engine's multiplexer handle, the per-descriptor watch
//! registry, the active-transfer table and the single deadline timer. The
//! engine tells it what to watch through [`EngineCallbacks`]; the reactor
//! tells it what became ready through the wait completions issued here; and
//! it tells the engine to make progress with `process_readiness` /
//! `process_timeout`, draining finished-transfer notifications after every
//! such call.
//!
//! Reentrancy discipline: a depth counter is held for the duration of every
//! progress call into the engine and every engine-originated callback. While
//! it is non-zero, `Transfer::start` is refused and `Transfer::stop` is
//! queued; the queue is flushed as soon as the counter returns to zero, so
//! the engine's handle collection is never mutated while the engine is
//! iterating it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::engine::{Action, Engine, EngineCallbacks, EngineHandle, MultiHandle, WriteOutcome};
use crate::reactor::{Reactor, WaitOutcome};
use crate::socket::SocketWatch;
use crate::transfer::{Transfer, TransferInner};

/// Increments the bridge's call-depth counter for a scope. The mirror image
/// of holding the engine's callback stack: while any guard is alive, the
/// engine's transfer set must not be mutated.
struct DepthGuard<'a> {
    depth: &'a Cell<u32>,
}

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<u32>) -> Self {
        depth.set(depth.get() + 1);
        Self { depth }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get() - 1);
    }
}

pub(crate) struct BridgeCore {
    engine: Box<dyn Engine>,
    reactor: Box<dyn Reactor>,
    multi: MultiHandle,
    this: Weak<BridgeCore>,
    sockets: RefCell<HashMap<RawFd, Rc<SocketWatch>>>,
    transfers: RefCell<HashMap<EngineHandle, Rc<TransferInner>>>,
    deferred_stops: RefCell<Vec<EngineHandle>>,
    depth: Cell<u32>,
    terminated: Cell<bool>,
}

/// Public face of the adapter. Dropping it terminates (if the caller has not
/// already) and releases the multiplexer handle exactly once.
pub struct Bridge {
    core: Rc<BridgeCore>,
}

impl Bridge {
    /// Build the bridge around an engine and a reactor. Creates the engine's
    /// multiplexer and installs this bridge as its callback sink.
    pub fn new(engine: Box<dyn Engine>, reactor: Box<dyn Reactor>) -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<BridgeCore>| {
            let callbacks: Weak<dyn EngineCallbacks> = weak.clone();
            let multi = engine.create_multi(callbacks);
            BridgeCore {
                engine,
                reactor,
                multi,
                this: weak.clone(),
                sockets: RefCell::new(HashMap::new()),
                transfers: RefCell::new(HashMap::new()),
                deferred_stops: RefCell::new(Vec::new()),
                depth: Cell::new(0),
                terminated: Cell::new(false),
            }
        });
        Self { core }
    }

    /// Hand out a new idle transfer bound to this bridge.
    pub fn create_transfer(&self) -> Transfer {
        Transfer::new(Rc::downgrade(&self.core))
    }

    /// Tear the bridge down: cancel the deadline timer and every socket
    /// wait, empty the registry and detach all active transfers (no
    /// completion fires for transfers that were mid-flight).
    ///
    /// # Panics
    ///
    /// Terminating twice is a programming error, not a recoverable
    /// condition.
    pub fn terminate(&self) {
        self.core.terminate();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if !self.core.terminated.get() {
            self.core.terminate();
        }
        self.core.engine.release_multi(self.core.multi);
    }
}

impl BridgeCore {
    pub(crate) fn engine(&self) -> &dyn Engine {
        &*self.engine
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.get()
    }

    /// Hand a transfer to the engine and, on success, take the self-lock by
    /// inserting it into the active table.
    pub(crate) fn register_transfer(
        &self,
        handle: EngineHandle,
        transfer: Rc<TransferInner>,
    ) -> bool {
        if self.terminated.get() {
            debug!(%handle, "register refused: bridge terminated");
            return false;
        }
        match self.engine.register(self.multi, handle) {
            Ok(()) => {
                self.transfers.borrow_mut().insert(handle, transfer);
                true
            }
            Err(err) => {
                debug!(%handle, %err, "engine refused transfer registration");
                false
            }
        }
    }

    /// Take a transfer back from the engine and release its self-lock.
    /// Leaves the table untouched if the engine refuses.
    pub(crate) fn deregister_transfer(&self, handle: EngineHandle) -> bool {
        match self.engine.deregister(self.multi, handle) {
            Ok(()) => {
                self.transfers.borrow_mut().remove(&handle);
                true
            }
            Err(err) => {
                debug!(%handle, %err, "engine refused transfer deregistration");
                false
            }
        }
    }

    /// Queue a deregistration requested from inside an engine callback.
    pub(crate) fn defer_stop(&self, handle: EngineHandle) {
        self.deferred_stops.borrow_mut().push(handle);
    }

    fn terminate(&self) {
        assert!(!self.terminated.get(), "bridge terminated twice");
        self.terminated.set(true);
        debug!("terminating bridge");

        self.reactor.cancel_timer();

        let sockets = std::mem::take(&mut *self.sockets.borrow_mut());
        for watch in sockets.into_values() {
            trace!(fd = watch.fd(), "dropping socket watch");
            watch.mark_removed();
            self.reactor.cancel(watch.id());
            self.reactor.release_socket(watch.id());
        }

        let transfers = std::mem::take(&mut *self.transfers.borrow_mut());
        for transfer in transfers.into_values() {
            transfer.detach();
        }
        self.deferred_stops.borrow_mut().clear();
    }

    /// Issue reactor waits for a descriptor, reconciling the action we were
    /// dispatched with against the watch's currently requested one. If they
    /// conflict, or the request now covers both directions while a
    /// single-direction wait is outstanding, outstanding waits are canceled
    /// and the recorded action wins.
    fn issue_waits(&self, fd: RawFd, mut action: Action, watch: &Rc<SocketWatch>) {
        let requested = watch.requested_action();
        trace!(fd, ?action, ?requested, "issuing waits");
        if requested == Action::Both || (requested != action && requested != Action::None) {
            self.reactor.cancel(watch.id());
            action = requested;
        }

        if action.wants_read() {
            self.reactor
                .wait_readable(watch.id(), self.wait_completion(fd, Action::Read, watch));
        }
        if action.wants_write() {
            self.reactor
                .wait_writable(watch.id(), self.wait_completion(fd, Action::Write, watch));
        }
    }

    fn wait_completion(
        &self,
        fd: RawFd,
        action: Action,
        watch: &Rc<SocketWatch>,
    ) -> Box<dyn FnOnce(WaitOutcome)> {
        let this = self.this.clone();
        let watch = watch.clone();
        Box::new(move |outcome| {
            if let Some(core) = this.upgrade() {
                core.on_wait_complete(outcome, fd, action, &watch);
            }
        })
    }

    /// Reactor completion for one readiness probe. Drives the engine, drains
    /// finished transfers and re-arms or cancels the socket's waits
    /// depending on whether anything is still in flight.
    fn on_wait_complete(&self, outcome: WaitOutcome, fd: RawFd, action: Action, watch: &Rc<SocketWatch>) {
        if outcome == WaitOutcome::Cancelled {
            trace!(fd, ?action, "wait cancelled");
            return;
        }

        trace!(fd, ?action, "socket ready");
        let result = {
            let _guard = DepthGuard::enter(&self.depth);
            self.engine.process_readiness(self.multi, fd, action)
        };
        match result {
            Ok(in_flight) => {
                self.drain_completions();
                if in_flight > 0 && !watch.is_removed() {
                    self.issue_waits(fd, action, watch);
                } else {
                    self.reactor.cancel(watch.id());
                }
            }
            Err(err) => {
                warn!(fd, ?action, %err, "engine failed to process readiness");
            }
        }
        self.flush_deferred_stops();
    }

    /// Pull finished-transfer notifications until none remain. Each one is
    /// deregistered (failure is logged; the transfer is finalized locally
    /// regardless), unlocked and notified.
    fn drain_completions(&self) {
        while let Some((handle, code)) = self.engine.poll_completed(self.multi) {
            let transfer = self.transfers.borrow_mut().remove(&handle);
            let Some(transfer) = transfer else {
                debug!(%handle, "completion for unknown transfer");
                continue;
            };
            if let Err(err) = self.engine.deregister(self.multi, handle) {
                debug!(%handle, %err, "could not deregister finished transfer");
            }
            transfer.finish(code);
        }
    }

    /// Flush stops that were requested from inside an engine callback. Runs
    /// only once the callback stack has fully unwound, and is idempotent
    /// against the completion drain having already removed the handle.
    fn flush_deferred_stops(&self) {
        if self.depth.get() != 0 {
            return;
        }
        loop {
            let handle = self.deferred_stops.borrow_mut().pop();
            let Some(handle) = handle else { break };
            if !self.transfers.borrow().contains_key(&handle) {
                trace!(%handle, "deferred stop: handle already removed");
                continue;
            }
            if !self.deregister_transfer(handle) {
                warn!(%handle, "deferred stop: engine refused deregistration");
            }
        }
    }

    /// The deadline elapsed (or was already due): let the engine make
    /// timeout-driven progress, then drain.
    fn on_timer_fired(&self) {
        let result = {
            let _guard = DepthGuard::enter(&self.depth);
            self.engine.process_timeout(self.multi)
        };
        match result {
            Ok(_in_flight) => self.drain_completions(),
            Err(err) => warn!(%err, "engine failed to process timeout"),
        }
        self.flush_deferred_stops();
    }
}

impl EngineCallbacks for BridgeCore {
    fn on_socket_action(&self, fd: RawFd, action: Action) -> i32 {
        let _guard = DepthGuard::enter(&self.depth);
        trace!(fd, ?action, "socket action from engine");

        if action == Action::Remove {
            let watch = self.sockets.borrow_mut().remove(&fd);
            if let Some(watch) = watch {
                watch.mark_removed();
                self.reactor.cancel(watch.id());
                self.engine.assign_slot(self.multi, fd, false);
                self.reactor.release_socket(watch.id());
            }
            return 0;
        }

        let existing = self.sockets.borrow().get(&fd).cloned();
        let watch = match existing {
            Some(watch) => watch,
            None => {
                let id = match self.reactor.adopt_socket(fd) {
                    Ok(id) => id,
                    Err(err) => {
                        // The engine retries or eventually surfaces its own
                        // timeout; nothing for us to do.
                        debug!(fd, %err, "ignoring unsupported socket");
                        return 0;
                    }
                };
                let watch = SocketWatch::new(fd, id);
                self.engine.assign_slot(self.multi, fd, true);
                self.sockets.borrow_mut().insert(fd, watch.clone());
                watch
            }
        };

        if action != Action::None {
            watch.set_requested_action(action, &*self.reactor);
            self.issue_waits(fd, action, &watch);
        }
        0
    }

    fn on_timer_change(&self, timeout_ms: i64) -> i32 {
        trace!(timeout_ms, "timer change from engine");
        self.reactor.cancel_timer();

        if timeout_ms > 0 {
            let this = self.this.clone();
            self.reactor.schedule_timer(
                std::time::Duration::from_millis(timeout_ms as u64),
                Box::new(move |outcome| {
                    if outcome == WaitOutcome::Ready {
                        if let Some(core) = this.upgrade() {
                            core.on_timer_fired();
                        }
                    }
                }),
            );
        } else {
            // Zero or negative means "already due": make progress before
            // returning to the reactor.
            self.on_timer_fired();
        }
        0
    }

    fn on_data(&self, handle: EngineHandle, chunk: Bytes) -> WriteOutcome {
        let len = chunk.len();
        let _guard = DepthGuard::enter(&self.depth);
        let transfer = self.transfers.borrow().get(&handle).cloned();
        match transfer {
            Some(transfer) => transfer.deliver(chunk),
            None => {
                trace!(%handle, len, "data for unknown transfer, accepting");
                WriteOutcome::Consumed(len)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResultCode;
    use crate::testing::{EngineOp, MockEngine, MockReactor, ProgressCall};

    fn setup() -> (MockEngine, MockReactor, Bridge) {
        let engine = MockEngine::new();
        let reactor = MockReactor::new();
        let bridge = Bridge::new(Box::new(engine.clone()), Box::new(reactor.clone()));
        (engine, reactor, bridge)
    }

    /// Start a transfer whose registration makes the engine ask for a read
    /// watch on `fd` right away.
    fn start_watching(
        engine: &MockEngine,
        bridge: &Bridge,
        fd: RawFd,
        action: Action,
    ) -> Transfer {
        let transfer = bridge.create_transfer();
        engine.on_register(vec![EngineOp::TimerChange(0)]);
        engine.on_progress(vec![EngineOp::SocketAction(fd, action), EngineOp::Return(1)]);
        assert!(transfer.start("tcp://peer:9"));
        transfer
    }

    #[test]
    fn registration_callback_creates_one_watch_per_descriptor() {
        let (engine, reactor, bridge) = setup();
        start_watching(&engine, &bridge, 7, Action::Read);

        assert_eq!(reactor.sockets_for(7), 1);
        assert_eq!(engine.slot(7), Some(true));
        assert_eq!(reactor.read_waits(7), 1);
        assert_eq!(reactor.write_waits(7), 0);

        // A change request reuses the existing watch.
        engine.on_progress(vec![EngineOp::SocketAction(7, Action::Both), EngineOp::Return(1)]);
        assert!(reactor.fire_ready(7, false));
        assert_eq!(reactor.sockets_for(7), 1);
        assert!(reactor.read_waits(7) >= 1);
        assert!(reactor.write_waits(7) >= 1);
    }

    #[test]
    fn remove_action_clears_registry_and_slot() {
        let (engine, reactor, bridge) = setup();
        start_watching(&engine, &bridge, 7, Action::Read);
        assert!(reactor.has_socket(7));

        engine.on_progress(vec![EngineOp::SocketAction(7, Action::Remove), EngineOp::Return(0)]);
        assert!(reactor.fire_ready(7, false));

        assert!(!reactor.has_socket(7));
        assert_eq!(engine.slot(7), Some(false));
        assert_eq!(reactor.read_waits(7), 0);
    }

    #[test]
    fn unsupported_socket_is_silently_ignored() {
        let (engine, reactor, bridge) = setup();
        reactor.set_unsupported(13);
        start_watching(&engine, &bridge, 13, Action::Read);

        assert!(!reactor.has_socket(13));
        assert_eq!(engine.slot(13), None);
        assert_eq!(reactor.read_waits(13), 0);
    }

    #[test]
    fn both_direction_request_rearms_both_waits_after_single_completion() {
        let (engine, reactor, bridge) = setup();
        start_watching(&engine, &bridge, 7, Action::Both);
        assert_eq!(reactor.read_waits(7), 1);
        assert_eq!(reactor.write_waits(7), 1);

        engine.on_progress(vec![EngineOp::Return(1)]);
        assert!(reactor.fire_ready(7, false));

        // The outstanding write wait was canceled and both were re-issued.
        assert_eq!(reactor.read_waits(7), 1);
        assert_eq!(reactor.write_waits(7), 1);
        assert_eq!(
            engine.calls().last(),
            Some(&ProgressCall::Readiness(7, Action::Read))
        );
    }

    #[test]
    fn waits_are_cancelled_when_nothing_is_in_flight() {
        let (engine, reactor, bridge) = setup();
        start_watching(&engine, &bridge, 7, Action::Read);

        let transfer_handle = engine.last_handle();
        engine.on_progress(vec![
            EngineOp::Complete(transfer_handle, ResultCode::OK),
            EngineOp::Return(0),
        ]);
        assert!(reactor.fire_ready(7, false));
        assert_eq!(reactor.read_waits(7), 0);
    }

    #[test]
    fn newer_deadline_replaces_pending_one() {
        let (engine, reactor, bridge) = setup();
        start_watching(&engine, &bridge, 7, Action::Read);

        engine.on_progress(vec![EngineOp::TimerChange(5_000), EngineOp::Return(1)]);
        assert!(reactor.fire_ready(7, false));
        assert!(reactor.timer_pending());

        engine.on_progress(vec![EngineOp::TimerChange(10_000), EngineOp::Return(1)]);
        assert!(reactor.fire_ready(7, false));

        assert_eq!(reactor.timer_after(), Some(std::time::Duration::from_millis(10_000)));
        assert_eq!(reactor.timers_scheduled(), 2);
        assert_eq!(reactor.timers_cancelled(), 1);
    }

    #[test]
    fn due_deadline_runs_progress_synchronously() {
        let (engine, reactor, bridge) = setup();
        let transfer = bridge.create_transfer();
        engine.on_register(vec![EngineOp::TimerChange(0)]);
        assert!(transfer.start("tcp://peer:9"));

        assert_eq!(engine.calls(), vec![ProgressCall::Timeout]);
        assert_eq!(reactor.timers_scheduled(), 0);
    }

    #[test]
    fn timer_fire_drives_timeout_progress() {
        let (engine, reactor, bridge) = setup();
        start_watching(&engine, &bridge, 7, Action::Read);

        engine.on_progress(vec![EngineOp::TimerChange(50), EngineOp::Return(1)]);
        assert!(reactor.fire_ready(7, false));
        assert!(reactor.timer_pending());

        engine.on_progress(vec![EngineOp::Return(1)]);
        assert!(reactor.fire_timer());
        assert_eq!(engine.calls().last(), Some(&ProgressCall::Timeout));
    }

    #[test]
    fn terminate_empties_registry_and_detaches_transfers() {
        let (engine, reactor, bridge) = setup();
        let transfer = start_watching(&engine, &bridge, 7, Action::Read);

        bridge.terminate();

        assert!(!reactor.has_socket(7));
        assert_eq!(reactor.read_waits(7), 0);
        // Detached: lifecycle calls refuse, no completion ever fires.
        assert!(!transfer.stop());
        assert!(!transfer.start("tcp://elsewhere:1"));
    }

    #[test]
    #[should_panic(expected = "terminated twice")]
    fn double_terminate_is_fatal() {
        let (_engine, _reactor, bridge) = setup();
        bridge.terminate();
        bridge.terminate();
    }

    #[test]
    fn drop_releases_the_multiplexer_once() {
        let (engine, _reactor, bridge) = setup();
        drop(bridge);
        assert!(engine.multi_released());
    }

    #[test]
    fn drop_after_terminate_still_releases_the_multiplexer() {
        let (engine, _reactor, bridge) = setup();
        bridge.terminate();
        drop(bridge);
        assert!(engine.multi_released());
    }
}
