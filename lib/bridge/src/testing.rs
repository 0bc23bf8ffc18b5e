// SPDX-License-Identifier: Apache-2.0

//! Deterministic engine and reactor doubles.
//!
//! [`MockEngine`] is scripted: tests enqueue [`EngineOp`]s that it replays —
//! invoking the bridge's callbacks synchronously, exactly like a real engine
//! would — whenever the bridge asks it to make progress (and, separately, at
//! registration time). [`MockReactor`] parks waits and timers until the test
//! fires or cancels them. Both are cloneable handles over shared state so a
//! test can keep poking them after moving a clone into the bridge.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::engine::{
    Action, Engine, EngineCallbacks, EngineHandle, MultiHandle, ResultCode, WriteOutcome,
};
use crate::error::BridgeError;
use crate::reactor::{Reactor, SocketId, WaitCallback, WaitOutcome};

/// One step of scripted engine behavior.
#[derive(Clone)]
pub enum EngineOp {
    /// Ask the bridge to watch (or stop watching) a descriptor.
    SocketAction(RawFd, Action),
    /// Ask the bridge to re-arm the deadline timer.
    TimerChange(i64),
    /// Deliver a chunk of data for a transfer. A short write fails the
    /// transfer with [`MockEngine::WRITE_FAILED`]; a pause parks it.
    Deliver(EngineHandle, Bytes),
    /// Report a transfer as finished.
    Complete(EngineHandle, ResultCode),
    /// Stop replaying and report this many transfers still in flight.
    Return(usize),
}

/// Which progress entry point the bridge invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressCall {
    Readiness(RawFd, Action),
    Timeout,
}

#[derive(Default)]
struct EngineState {
    next_handle: u64,
    callbacks: Option<Weak<dyn EngineCallbacks>>,
    multi_released: bool,
    targets: HashMap<EngineHandle, Option<String>>,
    registered: HashSet<EngineHandle>,
    failed: HashSet<EngineHandle>,
    paused: HashSet<EngineHandle>,
    completed: VecDeque<(EngineHandle, ResultCode)>,
    register_script: VecDeque<EngineOp>,
    progress_script: VecDeque<EngineOp>,
    fail_register: bool,
    fail_deregister: bool,
    slots: HashMap<RawFd, bool>,
    calls: Vec<ProgressCall>,
    deregistered: Vec<EngineHandle>,
    last_handle: Option<EngineHandle>,
}

#[derive(Clone, Default)]
pub struct MockEngine {
    state: Rc<RefCell<EngineState>>,
}

impl MockEngine {
    /// Result code the mock uses when a write is refused mid-transfer.
    pub const WRITE_FAILED: ResultCode = ResultCode(23);

    pub fn new() -> Self {
        Self::default()
    }

    /// Script ops replayed synchronously from inside `register`.
    pub fn on_register(&self, ops: impl IntoIterator<Item = EngineOp>) {
        self.state.borrow_mut().register_script.extend(ops);
    }

    /// Script ops replayed on the next progress call(s).
    pub fn on_progress(&self, ops: impl IntoIterator<Item = EngineOp>) {
        self.state.borrow_mut().progress_script.extend(ops);
    }

    pub fn fail_next_register(&self) {
        self.state.borrow_mut().fail_register = true;
    }

    pub fn fail_next_deregister(&self) {
        self.state.borrow_mut().fail_deregister = true;
    }

    /// Handle allocated by the most recent `create_handle`.
    pub fn last_handle(&self) -> EngineHandle {
        self.state.borrow().last_handle.expect("no handle created")
    }

    pub fn is_registered(&self, handle: EngineHandle) -> bool {
        self.state.borrow().registered.contains(&handle)
    }

    pub fn handle_exists(&self, handle: EngineHandle) -> bool {
        self.state.borrow().targets.contains_key(&handle)
    }

    pub fn target(&self, handle: EngineHandle) -> Option<String> {
        self.state.borrow().targets.get(&handle).cloned().flatten()
    }

    pub fn slot(&self, fd: RawFd) -> Option<bool> {
        self.state.borrow().slots.get(&fd).copied()
    }

    pub fn is_paused(&self, handle: EngineHandle) -> bool {
        self.state.borrow().paused.contains(&handle)
    }

    pub fn calls(&self) -> Vec<ProgressCall> {
        self.state.borrow().calls.clone()
    }

    pub fn deregistered(&self) -> Vec<EngineHandle> {
        self.state.borrow().deregistered.clone()
    }

    pub fn multi_released(&self) -> bool {
        self.state.borrow().multi_released
    }

    fn callbacks(&self) -> Option<Rc<dyn EngineCallbacks>> {
        self.state.borrow().callbacks.as_ref().and_then(Weak::upgrade)
    }

    /// Replay a script queue one op at a time; the state borrow is dropped
    /// around every callback because callbacks reenter the engine (slot
    /// assignment, nested progress calls).
    fn run_script(&self, register_time: bool) -> usize {
        loop {
            let op = {
                let mut state = self.state.borrow_mut();
                let queue = if register_time {
                    &mut state.register_script
                } else {
                    &mut state.progress_script
                };
                queue.pop_front()
            };
            let Some(op) = op else { break };
            let Some(callbacks) = self.callbacks() else { break };
            match op {
                EngineOp::SocketAction(fd, action) => {
                    callbacks.on_socket_action(fd, action);
                }
                EngineOp::TimerChange(timeout_ms) => {
                    callbacks.on_timer_change(timeout_ms);
                }
                EngineOp::Deliver(handle, chunk) => {
                    let skip = {
                        let state = self.state.borrow();
                        !state.registered.contains(&handle)
                            || state.failed.contains(&handle)
                            || state.paused.contains(&handle)
                    };
                    if skip {
                        continue;
                    }
                    let len = chunk.len();
                    match callbacks.on_data(handle, chunk) {
                        WriteOutcome::Consumed(n) if n == len => {}
                        WriteOutcome::Consumed(_) => {
                            let mut state = self.state.borrow_mut();
                            state.failed.insert(handle);
                            state.completed.push_back((handle, Self::WRITE_FAILED));
                        }
                        WriteOutcome::Pause => {
                            self.state.borrow_mut().paused.insert(handle);
                        }
                    }
                }
                EngineOp::Complete(handle, code) => {
                    self.state.borrow_mut().completed.push_back((handle, code));
                }
                EngineOp::Return(in_flight) => return in_flight,
            }
        }
        let state = self.state.borrow();
        state.registered.len().saturating_sub(state.completed.len())
    }
}

impl Engine for MockEngine {
    fn create_multi(&self, callbacks: Weak<dyn EngineCallbacks>) -> MultiHandle {
        self.state.borrow_mut().callbacks = Some(callbacks);
        MultiHandle(1)
    }

    fn release_multi(&self, _multi: MultiHandle) {
        self.state.borrow_mut().multi_released = true;
    }

    fn create_handle(&self) -> Option<EngineHandle> {
        let mut state = self.state.borrow_mut();
        state.next_handle += 1;
        let handle = EngineHandle(state.next_handle);
        state.targets.insert(handle, None);
        state.last_handle = Some(handle);
        Some(handle)
    }

    fn reset_handle(&self, handle: EngineHandle) {
        let mut state = self.state.borrow_mut();
        state.targets.insert(handle, None);
        state.failed.remove(&handle);
        state.paused.remove(&handle);
    }

    fn release_handle(&self, handle: EngineHandle) {
        let mut state = self.state.borrow_mut();
        state.targets.remove(&handle);
        state.failed.remove(&handle);
        state.paused.remove(&handle);
    }

    fn set_target(&self, handle: EngineHandle, target: &str) {
        self.state
            .borrow_mut()
            .targets
            .insert(handle, Some(target.to_string()));
    }

    fn register(&self, _multi: MultiHandle, handle: EngineHandle) -> Result<(), BridgeError> {
        {
            let mut state = self.state.borrow_mut();
            if state.fail_register {
                state.fail_register = false;
                return Err(BridgeError::EngineRejected);
            }
            state.registered.insert(handle);
        }
        self.run_script(true);
        Ok(())
    }

    fn deregister(&self, _multi: MultiHandle, handle: EngineHandle) -> Result<(), BridgeError> {
        let mut state = self.state.borrow_mut();
        if state.fail_deregister {
            state.fail_deregister = false;
            return Err(BridgeError::EngineRejected);
        }
        state.registered.remove(&handle);
        state.paused.remove(&handle);
        state.deregistered.push(handle);
        Ok(())
    }

    fn assign_slot(&self, _multi: MultiHandle, fd: RawFd, associated: bool) {
        self.state.borrow_mut().slots.insert(fd, associated);
    }

    fn process_readiness(
        &self,
        _multi: MultiHandle,
        fd: RawFd,
        action: Action,
    ) -> Result<usize, BridgeError> {
        self.state
            .borrow_mut()
            .calls
            .push(ProgressCall::Readiness(fd, action));
        Ok(self.run_script(false))
    }

    fn process_timeout(&self, _multi: MultiHandle) -> Result<usize, BridgeError> {
        self.state.borrow_mut().calls.push(ProgressCall::Timeout);
        Ok(self.run_script(false))
    }

    fn poll_completed(&self, _multi: MultiHandle) -> Option<(EngineHandle, ResultCode)> {
        self.state.borrow_mut().completed.pop_front()
    }
}

struct PendingWait {
    id: SocketId,
    fd: RawFd,
    write: bool,
    done: WaitCallback,
}

struct PendingTimer {
    after: Duration,
    done: WaitCallback,
}

#[derive(Default)]
struct ReactorState {
    next_id: u64,
    sockets: HashMap<SocketId, RawFd>,
    unsupported: HashSet<RawFd>,
    waits: Vec<PendingWait>,
    timer: Option<PendingTimer>,
    timers_scheduled: usize,
    timers_cancelled: usize,
    readable: HashMap<RawFd, usize>,
}

#[derive(Clone, Default)]
pub struct MockReactor {
    state: Rc<RefCell<ReactorState>>,
}

impl MockReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `adopt_socket` refuse this descriptor.
    pub fn set_unsupported(&self, fd: RawFd) {
        self.state.borrow_mut().unsupported.insert(fd);
    }

    pub fn set_readable_bytes(&self, fd: RawFd, bytes: usize) {
        self.state.borrow_mut().readable.insert(fd, bytes);
    }

    pub fn has_socket(&self, fd: RawFd) -> bool {
        self.state.borrow().sockets.values().any(|&f| f == fd)
    }

    /// How many adopted (and not yet released) sockets duplicate `fd`.
    pub fn sockets_for(&self, fd: RawFd) -> usize {
        self.state.borrow().sockets.values().filter(|&&f| f == fd).count()
    }

    pub fn read_waits(&self, fd: RawFd) -> usize {
        self.state
            .borrow()
            .waits
            .iter()
            .filter(|w| w.fd == fd && !w.write)
            .count()
    }

    pub fn write_waits(&self, fd: RawFd) -> usize {
        self.state
            .borrow()
            .waits
            .iter()
            .filter(|w| w.fd == fd && w.write)
            .count()
    }

    pub fn timer_pending(&self) -> bool {
        self.state.borrow().timer.is_some()
    }

    pub fn timer_after(&self) -> Option<Duration> {
        self.state.borrow().timer.as_ref().map(|t| t.after)
    }

    pub fn timers_scheduled(&self) -> usize {
        self.state.borrow().timers_scheduled
    }

    pub fn timers_cancelled(&self) -> usize {
        self.state.borrow().timers_cancelled
    }

    /// Complete the oldest matching wait as ready. Returns `false` if none
    /// was pending.
    pub fn fire_ready(&self, fd: RawFd, write: bool) -> bool {
        let wait = {
            let mut state = self.state.borrow_mut();
            let pos = state.waits.iter().position(|w| w.fd == fd && w.write == write);
            pos.map(|p| state.waits.remove(p))
        };
        match wait {
            Some(wait) => {
                (wait.done)(WaitOutcome::Ready);
                true
            }
            None => false,
        }
    }

    /// Fire the pending deadline. Returns `false` if none was armed.
    pub fn fire_timer(&self) -> bool {
        let timer = self.state.borrow_mut().timer.take();
        match timer {
            Some(timer) => {
                (timer.done)(WaitOutcome::Ready);
                true
            }
            None => false,
        }
    }

    fn cancel_waits(&self, id: SocketId) {
        let cancelled: Vec<PendingWait> = {
            let mut state = self.state.borrow_mut();
            let (cancelled, kept) = std::mem::take(&mut state.waits)
                .into_iter()
                .partition(|w| w.id == id);
            state.waits = kept;
            cancelled
        };
        for wait in cancelled {
            (wait.done)(WaitOutcome::Cancelled);
        }
    }
}

impl Reactor for MockReactor {
    fn adopt_socket(&self, fd: RawFd) -> Result<SocketId, BridgeError> {
        let mut state = self.state.borrow_mut();
        if state.unsupported.contains(&fd) {
            return Err(BridgeError::SocketUnsupported);
        }
        state.next_id += 1;
        let id = SocketId(state.next_id);
        state.sockets.insert(id, fd);
        Ok(id)
    }

    fn release_socket(&self, id: SocketId) {
        self.state.borrow_mut().sockets.remove(&id);
        self.cancel_waits(id);
    }

    fn wait_readable(&self, id: SocketId, done: WaitCallback) {
        let fd = self.state.borrow().sockets.get(&id).copied();
        match fd {
            Some(fd) => self.state.borrow_mut().waits.push(PendingWait {
                id,
                fd,
                write: false,
                done,
            }),
            None => done(WaitOutcome::Cancelled),
        }
    }

    fn wait_writable(&self, id: SocketId, done: WaitCallback) {
        let fd = self.state.borrow().sockets.get(&id).copied();
        match fd {
            Some(fd) => self.state.borrow_mut().waits.push(PendingWait {
                id,
                fd,
                write: true,
                done,
            }),
            None => done(WaitOutcome::Cancelled),
        }
    }

    fn cancel(&self, id: SocketId) {
        self.cancel_waits(id);
    }

    fn readable_bytes(&self, id: SocketId) -> usize {
        let state = self.state.borrow();
        state
            .sockets
            .get(&id)
            .and_then(|fd| state.readable.get(fd))
            .copied()
            .unwrap_or(0)
    }

    fn schedule_timer(&self, after: Duration, done: WaitCallback) {
        let replaced = {
            let mut state = self.state.borrow_mut();
            state.timers_scheduled += 1;
            state.timer.replace(PendingTimer { after, done })
        };
        if let Some(old) = replaced {
            (old.done)(WaitOutcome::Cancelled);
        }
    }

    fn cancel_timer(&self) {
        let timer = {
            let mut state = self.state.borrow_mut();
            let timer = state.timer.take();
            if timer.is_some() {
                state.timers_cancelled += 1;
            }
            timer
        };
        if let Some(timer) = timer {
            (timer.done)(WaitOutcome::Cancelled);
        }
    }
}
