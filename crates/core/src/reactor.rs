// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Host-side I/O reactor.
//!
//! A single-threaded, level-triggered readiness multiplexer over `poll(2)`.
//! TAP interfaces, TCP servers (GDB, serial-over-TCP) and raw fds register
//! here; the main loop calls [`Reactor::run_once`] with a timeout derived
//! from the cycle clock's first timer expiry so timers fire promptly while
//! the CPU is idle.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn,
};

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("invalid listen address {0}")]
    BadAddress(String),
    #[error("socket setup failed: {0}")]
    Socket(#[from] nix::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ReactorResult<T> = Result<T, ReactorError>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

type ReadCallback = Box<dyn FnMut(&StreamHandle, &[u8])>;
type AcceptCallback = Box<dyn FnMut(StreamHandle, SocketAddr)>;
type PollCallback = Box<dyn FnMut(EventMask)>;
type FreeCallback = Box<dyn FnOnce()>;

struct WriteOp {
    buf: Vec<u8>,
    done: usize,
    completion: Option<FreeCallback>,
}

struct StreamState {
    id: u64,
    stream: TcpStream,
    read_cb: RefCell<Option<Rc<RefCell<ReadCallback>>>>,
    write_queue: RefCell<VecDeque<WriteOp>>,
    closing: Cell<bool>,
}

struct ServerState {
    id: u64,
    listener: TcpListener,
    nodelay: bool,
    accept_cb: RefCell<AcceptCallback>,
}

struct PollState {
    id: u64,
    fd: RawFd,
    mask: Cell<EventMask>,
    callback: RefCell<Option<Rc<RefCell<PollCallback>>>>,
}

enum Source {
    Stream(Rc<StreamState>),
    Server(Rc<ServerState>),
    Poll(Rc<PollState>),
}

#[derive(Default)]
struct ReactorInner {
    next_id: u64,
    sources: BTreeMap<u64, Source>,
    pending_free: Vec<FreeCallback>,
}

/// The process-wide reactor handle. Cheap to clone.
#[derive(Clone, Default)]
pub struct Reactor {
    inner: Rc<RefCell<ReactorInner>>,
}

/// A raw-fd readiness handle (TAP devices, pipes). The reactor never owns
/// or closes the fd.
#[derive(Clone)]
pub struct PollHandle {
    reactor: Reactor,
    state: Rc<PollState>,
}

/// A bidirectional byte stream (an accepted TCP connection).
#[derive(Clone)]
pub struct StreamHandle {
    reactor: Reactor,
    state: Rc<StreamState>,
}

/// A listening TCP server delivering accepted connections to its callback.
#[derive(Clone)]
pub struct TcpServer {
    reactor: Reactor,
    state: Rc<ServerState>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Wrap an fd the caller owns for readiness notification.
    pub fn poll_handle(&self, fd: RawFd) -> PollHandle {
        let id = self.alloc_id();
        let state = Rc::new(PollState {
            id,
            fd,
            mask: Cell::new(EventMask::empty()),
            callback: RefCell::new(None),
        });
        self.inner
            .borrow_mut()
            .sources
            .insert(id, Source::Poll(state.clone()));
        PollHandle {
            reactor: self.clone(),
            state,
        }
    }

    /// Bind and listen; each accepted connection becomes a [`StreamHandle`]
    /// delivered to `accept_cb`.
    pub fn tcp_server(
        &self,
        host: &str,
        port: u16,
        backlog: i32,
        nodelay: bool,
        accept_cb: impl FnMut(StreamHandle, SocketAddr) + 'static,
    ) -> ReactorResult<TcpServer> {
        let ip: std::net::Ipv4Addr = host
            .parse()
            .map_err(|_| ReactorError::BadAddress(host.to_string()))?;
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )?;
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        let addr = SockaddrIn::from(SocketAddrV4::new(ip, port));
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(backlog).unwrap_or(Backlog::MAXCONN))?;
        let listener = TcpListener::from(fd);
        listener.set_nonblocking(true)?;

        let id = self.alloc_id();
        let state = Rc::new(ServerState {
            id,
            listener,
            nodelay,
            accept_cb: RefCell::new(Box::new(accept_cb)),
        });
        self.inner
            .borrow_mut()
            .sources
            .insert(id, Source::Server(state.clone()));
        Ok(TcpServer {
            reactor: self.clone(),
            state,
        })
    }

    fn adopt_stream(&self, stream: TcpStream) -> ReactorResult<StreamHandle> {
        stream.set_nonblocking(true)?;
        let id = self.alloc_id();
        let state = Rc::new(StreamState {
            id,
            stream,
            read_cb: RefCell::new(None),
            write_queue: RefCell::new(VecDeque::new()),
            closing: Cell::new(false),
        });
        self.inner
            .borrow_mut()
            .sources
            .insert(id, Source::Stream(state.clone()));
        Ok(StreamHandle {
            reactor: self.clone(),
            state,
        })
    }

    /// One reactor turn: wait up to `timeout` for readiness, dispatch every
    /// ready callback, then release deferred-closed handles. Returns the
    /// number of sources dispatched.
    pub fn run_once(&self, timeout: Duration) -> ReactorResult<usize> {
        struct Slot {
            id: u64,
            fd: RawFd,
            events: PollFlags,
        }
        let slots: Vec<Slot> = {
            let inner = self.inner.borrow();
            inner
                .sources
                .iter()
                .filter_map(|(&id, source)| {
                    let (fd, events) = match source {
                        Source::Server(s) => (s.listener.as_raw_fd(), PollFlags::POLLIN),
                        Source::Stream(s) => {
                            if s.closing.get() {
                                return None;
                            }
                            let mut events = PollFlags::empty();
                            if s.read_cb.borrow().is_some() {
                                events |= PollFlags::POLLIN;
                            }
                            if !s.write_queue.borrow().is_empty() {
                                events |= PollFlags::POLLOUT;
                            }
                            if events.is_empty() {
                                return None;
                            }
                            (s.stream.as_raw_fd(), events)
                        }
                        Source::Poll(s) => {
                            let mask = s.mask.get();
                            if s.callback.borrow().is_none() || mask.is_empty() {
                                return None;
                            }
                            let mut events = PollFlags::empty();
                            if mask.contains(EventMask::READABLE) {
                                events |= PollFlags::POLLIN;
                            }
                            if mask.contains(EventMask::WRITABLE) {
                                events |= PollFlags::POLLOUT;
                            }
                            (s.fd, events)
                        }
                    };
                    Some(Slot { id, fd, events })
                })
                .collect()
        };

        let mut ready: Vec<(u64, PollFlags)> = Vec::new();
        if !slots.is_empty() {
            // PollFd borrows the fd; the sources outlive this scope, so the
            // raw-fd borrow is sound.
            let mut fds: Vec<PollFd> = slots
                .iter()
                .map(|s| PollFd::new(unsafe { BorrowedFd::borrow_raw(s.fd) }, s.events))
                .collect();
            let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(_) => {}
                Err(nix::Error::EINTR) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
            for (slot, fd) in slots.iter().zip(fds.iter()) {
                if let Some(revents) = fd.revents() {
                    if !revents.is_empty() {
                        ready.push((slot.id, revents));
                    }
                }
            }
        } else if !timeout.is_zero() {
            std::thread::sleep(timeout);
        }

        let mut dispatched = 0;
        for (id, revents) in ready {
            let source = {
                let inner = self.inner.borrow();
                match inner.sources.get(&id) {
                    Some(Source::Stream(s)) => Some(Source::Stream(s.clone())),
                    Some(Source::Server(s)) => Some(Source::Server(s.clone())),
                    Some(Source::Poll(s)) => Some(Source::Poll(s.clone())),
                    // Removed by an earlier callback this turn.
                    None => None,
                }
            };
            match source {
                Some(Source::Server(server)) => {
                    self.dispatch_accept(&server);
                    dispatched += 1;
                }
                Some(Source::Stream(stream)) => {
                    self.dispatch_stream(&stream, revents);
                    dispatched += 1;
                }
                Some(Source::Poll(ph)) => {
                    let mut mask = EventMask::empty();
                    if revents.intersects(
                        PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                    ) {
                        mask |= EventMask::READABLE;
                    }
                    if revents.contains(PollFlags::POLLOUT) {
                        mask |= EventMask::WRITABLE;
                    }
                    let cb = ph.callback.borrow().clone();
                    if let Some(cb) = cb {
                        (cb.borrow_mut())(mask);
                        dispatched += 1;
                    }
                }
                None => {}
            }
        }

        // Deferred releases confirmed after the dispatch pass.
        let pending: Vec<FreeCallback> = {
            let mut inner = self.inner.borrow_mut();
            std::mem::take(&mut inner.pending_free)
        };
        for free in pending {
            free();
        }
        Ok(dispatched)
    }

    fn dispatch_accept(&self, server: &Rc<ServerState>) {
        loop {
            match server.listener.accept() {
                Ok((stream, peer)) => {
                    if server.nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    match self.adopt_stream(stream) {
                        Ok(handle) => (server.accept_cb.borrow_mut())(handle, peer),
                        Err(e) => tracing::warn!("dropping accepted connection: {e}"),
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn dispatch_stream(&self, state: &Rc<StreamState>, revents: PollFlags) {
        let handle = StreamHandle {
            reactor: self.clone(),
            state: state.clone(),
        };
        if revents.contains(PollFlags::POLLOUT) && !state.closing.get() {
            handle.drain_writes();
        }
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            && !state.closing.get()
        {
            let cb = state.read_cb.borrow().clone();
            if let Some(cb) = cb {
                let mut buf = [0u8; 4096];
                loop {
                    if state.closing.get() || state.read_cb.borrow().is_none() {
                        break;
                    }
                    match (&state.stream).read(&mut buf) {
                        Ok(0) => {
                            // EOF: the callback terminates the session.
                            (cb.borrow_mut())(&handle, &[]);
                            break;
                        }
                        Ok(n) => (cb.borrow_mut())(&handle, &buf[..n]),
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            tracing::debug!("stream read error: {e}");
                            (cb.borrow_mut())(&handle, &[]);
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl PollHandle {
    /// Enable level-triggered notifications for `mask`.
    pub fn start(&self, mask: EventMask, callback: impl FnMut(EventMask) + 'static) {
        self.state.mask.set(mask);
        *self.state.callback.borrow_mut() = Some(Rc::new(RefCell::new(Box::new(callback))));
    }

    /// Stop notifications; pending dispatches for this handle are dropped.
    pub fn stop(&self) {
        self.state.mask.set(EventMask::empty());
        *self.state.callback.borrow_mut() = None;
    }

    /// Unregister from the reactor. `free_cb` fires on the next reactor
    /// turn, after which the owner may reclaim the fd.
    pub fn close(&self, free_cb: Option<FreeCallback>) {
        self.stop();
        let mut inner = self.reactor.inner.borrow_mut();
        inner.sources.remove(&self.state.id);
        if let Some(cb) = free_cb {
            inner.pending_free.push(cb);
        }
    }
}

impl StreamHandle {
    /// Begin delivering inbound bytes to `callback`. An empty slice means
    /// EOF or error; the callback is expected to close the session.
    pub fn read_start(&self, callback: impl FnMut(&StreamHandle, &[u8]) + 'static) {
        *self.state.read_cb.borrow_mut() = Some(Rc::new(RefCell::new(Box::new(callback))));
    }

    pub fn read_stop(&self) {
        *self.state.read_cb.borrow_mut() = None;
    }

    /// Queue an asynchronous write. `completion` fires once the final byte
    /// has been handed to the platform; completion is guaranteed eventually
    /// as long as the reactor keeps running.
    pub fn write(&self, buf: impl Into<Vec<u8>>, completion: Option<FreeCallback>) {
        self.state.write_queue.borrow_mut().push_back(WriteOp {
            buf: buf.into(),
            done: 0,
            completion,
        });
        // Opportunistic drain; leftovers go out on POLLOUT.
        self.drain_writes();
    }

    fn drain_writes(&self) {
        loop {
            let mut queue = self.state.write_queue.borrow_mut();
            let Some(op) = queue.front_mut() else {
                return;
            };
            match (&self.state.stream).write(&op.buf[op.done..]) {
                Ok(n) => {
                    op.done += n;
                    if op.done >= op.buf.len() {
                        let completion = queue.pop_front().and_then(|op| op.completion);
                        drop(queue);
                        if let Some(cb) = completion {
                            cb();
                        }
                        continue;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::debug!("stream write error: {e}");
                    // Drop the queue; the read path will surface the error
                    // as an EOF to the owner.
                    queue.clear();
                    return;
                }
            }
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.stream.peer_addr().ok()
    }

    /// Tear the stream down. Pending dispatches are dropped before this
    /// returns; `free_cb` fires on the next reactor turn and may release
    /// owner state. The handle must not be used afterwards.
    pub fn close(&self, free_cb: Option<FreeCallback>) {
        self.state.closing.set(true);
        self.read_stop();
        let _ = self.state.stream.shutdown(std::net::Shutdown::Both);
        let mut inner = self.reactor.inner.borrow_mut();
        inner.sources.remove(&self.state.id);
        if let Some(cb) = free_cb {
            inner.pending_free.push(cb);
        }
    }
}

impl TcpServer {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.listener.local_addr().ok()
    }

    pub fn close(&self, free_cb: Option<FreeCallback>) {
        let mut inner = self.reactor.inner.borrow_mut();
        inner.sources.remove(&self.state.id);
        if let Some(cb) = free_cb {
            inner.pending_free.push(cb);
        }
    }
}
