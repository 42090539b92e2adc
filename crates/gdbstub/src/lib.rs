// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! GDB remote-serial-protocol server.
//!
//! Speaks `$payload#xx` framing over a TCP stream provided by the core
//! reactor and drives the target through the generic [`DebugBackend`]
//! contract. The packet decoder is an explicit byte-fed state machine, so
//! the whole session logic is testable without a socket.
//!
//! One session at a time: additional connections are closed on accept.

mod session;

pub use session::{GdbSession, SessionStatus};

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use veriboard_config::Config;
use veriboard_core::debug::DebugBackend;
use veriboard_core::reactor::{Reactor, StreamHandle, TcpServer};

struct ActiveSession {
    session: Rc<RefCell<GdbSession>>,
    stream: StreamHandle,
}

struct ServerInner {
    backend: Rc<RefCell<dyn DebugBackend>>,
    active: Option<ActiveSession>,
}

impl ServerInner {
    fn drop_session(&mut self) {
        if let Some(active) = self.active.take() {
            active.session.borrow_mut().teardown();
            active.stream.close(None);
        }
    }
}

/// The listening GDB server. Keep the handle alive for as long as debug
/// access should be offered.
pub struct GdbServer {
    inner: Rc<RefCell<ServerInner>>,
    server: TcpServer,
}

impl GdbServer {
    /// Create a server according to the `[gdebug]` configuration section.
    /// Returns `Ok(None)` when no server is configured.
    pub fn from_config(
        config: &Config,
        reactor: &Reactor,
        backend: Rc<RefCell<dyn DebugBackend>>,
    ) -> anyhow::Result<Option<Self>> {
        let Some(host) = config.read_var("gdebug", "host").map(str::to_string) else {
            tracing::info!("GDB server is not configured");
            return Ok(None);
        };
        let Ok(port) = config.read_int32("gdebug", "port") else {
            tracing::info!("GDB server is not configured");
            return Ok(None);
        };
        let server = Self::bind(&host, port as u16, reactor, backend)?;
        Ok(Some(server))
    }

    /// Bind explicitly; used directly by tests and embedding tools.
    pub fn bind(
        host: &str,
        port: u16,
        reactor: &Reactor,
        backend: Rc<RefCell<dyn DebugBackend>>,
    ) -> anyhow::Result<Self> {
        let inner = Rc::new(RefCell::new(ServerInner {
            backend,
            active: None,
        }));
        let weak: Weak<RefCell<ServerInner>> = Rc::downgrade(&inner);
        let server = reactor.tcp_server(host, port, 5, true, move |stream, peer| {
            let Some(inner) = weak.upgrade() else {
                stream.close(None);
                return;
            };
            Self::accept(&inner, stream, peer);
        })?;
        tracing::info!(
            "GDB server listening on host \"{}\" port {}",
            host,
            server
                .local_addr()
                .map(|a| a.port())
                .unwrap_or(port)
        );
        Ok(Self { inner, server })
    }

    fn accept(
        inner: &Rc<RefCell<ServerInner>>,
        stream: StreamHandle,
        peer: std::net::SocketAddr,
    ) {
        {
            let mut state = inner.borrow_mut();
            if state.active.is_some() {
                tracing::warn!("Only one gdb session allowed; closing {}", peer);
                drop(state);
                stream.close(None);
                return;
            }
            let out_stream = stream.clone();
            let session = Rc::new(RefCell::new(GdbSession::new(
                state.backend.clone(),
                move |bytes| out_stream.write(bytes.to_vec(), None),
            )));
            state.active = Some(ActiveSession {
                session: session.clone(),
                stream: stream.clone(),
            });
            let weak = Rc::downgrade(inner);
            stream.read_start(move |_handle, data| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let session = match &inner.borrow().active {
                    Some(active) => active.session.clone(),
                    None => return,
                };
                let status = if data.is_empty() {
                    SessionStatus::Ended
                } else {
                    session.borrow_mut().feed(data)
                };
                if status == SessionStatus::Ended {
                    inner.borrow_mut().drop_session();
                }
            });
        }
        tracing::info!("Accepted gdb connection from {}", peer);
    }

    /// Push an asynchronous stop notification (`T<sig>thread:0;`) to the
    /// live session, if any. Called by the target owner when the CPU stops
    /// spontaneously (breakpoint hit, fault).
    pub fn notify(&self, sig: u8) -> bool {
        let inner = self.inner.borrow();
        match &inner.active {
            Some(active) => {
                active.session.borrow_mut().notify(sig);
                true
            }
            None => false,
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.local_addr()
    }

    pub fn has_session(&self) -> bool {
        self.inner.borrow().active.is_some()
    }
}

impl Drop for GdbServer {
    fn drop(&mut self) {
        self.inner.borrow_mut().drop_session();
        self.server.close(None);
    }
}
