// SPDX-License-Identifier: Apache-2.0

//! Production [`Reactor`] on top of tokio's `AsyncFd`.
//!
//! Each readiness probe is a `spawn_local` task that races the descriptor's
//! readiness against a per-socket [`CancellationToken`]; canceling a socket
//! swaps in a fresh token so already-issued waits resolve as cancelled while
//! new waits start clean. Because everything is spawned locally, callbacks
//! are free to be `!Send` and to reenter the bridge. The reactor must live on
//! a [`tokio::task::LocalSet`] driven by a current-thread runtime.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use socket2::{Domain, Type};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Reactor, SocketId, WaitCallback, WaitOutcome};
use crate::error::BridgeError;

/// Address family and type of an adopted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    StreamV4,
    StreamV6,
    DatagramV4,
    DatagramV6,
}

struct AdoptedSocket {
    fd: Rc<AsyncFd<OwnedFd>>,
    kind: SocketKind,
    // Replaced wholesale on cancel; clones taken by in-flight waits keep
    // observing the old, now-cancelled token.
    cancel: RefCell<CancellationToken>,
}

pub struct TokioReactor {
    sockets: RefCell<HashMap<SocketId, Rc<AdoptedSocket>>>,
    timer: RefCell<Option<CancellationToken>>,
    next_id: Cell<u64>,
}

impl TokioReactor {
    pub fn new() -> Self {
        Self {
            sockets: RefCell::new(HashMap::new()),
            timer: RefCell::new(None),
            next_id: Cell::new(1),
        }
    }

    /// Classification of an adopted socket, mainly for diagnostics.
    pub fn socket_kind(&self, id: SocketId) -> Option<SocketKind> {
        self.sockets.borrow().get(&id).map(|s| s.kind)
    }

    fn classify(sock: &socket2::Socket) -> Result<SocketKind, BridgeError> {
        let ty = sock.r#type().map_err(|_| BridgeError::SocketUnsupported)?;
        let domain = sock.domain().map_err(|_| BridgeError::SocketUnsupported)?;
        match (ty, domain) {
            (Type::STREAM, Domain::IPV4) => Ok(SocketKind::StreamV4),
            (Type::STREAM, Domain::IPV6) => Ok(SocketKind::StreamV6),
            (Type::DGRAM, Domain::IPV4) => Ok(SocketKind::DatagramV4),
            (Type::DGRAM, Domain::IPV6) => Ok(SocketKind::DatagramV6),
            _ => Err(BridgeError::SocketUnsupported),
        }
    }

    fn wait(&self, id: SocketId, want_write: bool, done: WaitCallback) {
        let Some(sock) = self.sockets.borrow().get(&id).cloned() else {
            trace!(%id, "wait on unknown socket, completing cancelled");
            done(WaitOutcome::Cancelled);
            return;
        };
        let token = sock.cancel.borrow().clone();
        let fd = sock.fd.clone();
        tokio::task::spawn_local(async move {
            // Biased so a cancelled wait never reports Ready, even when the
            // descriptor became ready in the same tick.
            tokio::select! {
                biased;
                _ = token.cancelled() => done(WaitOutcome::Cancelled),
                ready = wait_ready(&fd, want_write) => {
                    if ready {
                        done(WaitOutcome::Ready)
                    } else {
                        done(WaitOutcome::Cancelled)
                    }
                }
            }
        });
    }
}

impl Default for TokioReactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Readiness probe: signals without clearing readiness, so repeated probes on
/// a still-ready descriptor complete immediately (the engine is the one
/// draining the socket).
async fn wait_ready(fd: &AsyncFd<OwnedFd>, want_write: bool) -> bool {
    let result = if want_write {
        fd.writable().await.map(|mut g| g.retain_ready())
    } else {
        fd.readable().await.map(|mut g| g.retain_ready())
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            debug!(%err, "readiness wait failed");
            false
        }
    }
}

impl Reactor for TokioReactor {
    fn adopt_socket(&self, fd: RawFd) -> Result<SocketId, BridgeError> {
        // SAFETY: the engine guarantees `fd` is a live socket for the
        // duration of this call; we only duplicate it.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let owned = borrowed
            .try_clone_to_owned()
            .map_err(|_| BridgeError::SocketUnsupported)?;
        let sock = socket2::Socket::from(owned);
        let kind = Self::classify(&sock)?;
        let async_fd = AsyncFd::with_interest(
            OwnedFd::from(sock),
            Interest::READABLE.add(Interest::WRITABLE),
        )
        .map_err(|_| BridgeError::SocketUnsupported)?;

        let id = SocketId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.sockets.borrow_mut().insert(
            id,
            Rc::new(AdoptedSocket {
                fd: Rc::new(async_fd),
                kind,
                cancel: RefCell::new(CancellationToken::new()),
            }),
        );
        trace!(%id, fd, ?kind, "adopted socket");
        Ok(id)
    }

    fn release_socket(&self, id: SocketId) {
        if let Some(sock) = self.sockets.borrow_mut().remove(&id) {
            sock.cancel.borrow().cancel();
            trace!(%id, "released socket");
        }
    }

    fn wait_readable(&self, id: SocketId, done: WaitCallback) {
        self.wait(id, false, done);
    }

    fn wait_writable(&self, id: SocketId, done: WaitCallback) {
        self.wait(id, true, done);
    }

    fn cancel(&self, id: SocketId) {
        let Some(sock) = self.sockets.borrow().get(&id).cloned() else {
            return;
        };
        let old = sock.cancel.replace(CancellationToken::new());
        old.cancel();
    }

    fn readable_bytes(&self, id: SocketId) -> usize {
        let Some(sock) = self.sockets.borrow().get(&id).cloned() else {
            return 0;
        };
        let mut count: libc::c_int = 0;
        let rc = unsafe {
            libc::ioctl(sock.fd.get_ref().as_raw_fd(), libc::FIONREAD, &mut count)
        };
        if rc == 0 && count > 0 { count as usize } else { 0 }
    }

    fn schedule_timer(&self, after: Duration, done: WaitCallback) {
        let token = CancellationToken::new();
        *self.timer.borrow_mut() = Some(token.clone());
        tokio::task::spawn_local(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => done(WaitOutcome::Cancelled),
                _ = tokio::time::sleep(after) => done(WaitOutcome::Ready),
            }
        });
    }

    fn cancel_timer(&self) {
        if let Some(token) = self.timer.borrow_mut().take() {
            token.cancel();
        }
    }
}
