//! Out-of-band control channel.
//!
//! One message per TCP connection: the client connects, writes the encoded
//! message and closes; the acceptor reads until end of stream, decodes the
//! message and files it in the node's [`Inbox`] tagged with the sender address.

use crate::message::{Message, MessageKind};
use crate::net;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Connect timeout of the wake-up connection made on shutdown.
const WAKE_TIMEOUT: Duration = Duration::from_millis(200);

/// Upper bound on an encoded control message.
const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// A decoded message and the address it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: IpAddr,
    pub message: Message,
}

/// Shared FIFO between the acceptor thread and the role's main thread.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: Mutex<VecDeque<Envelope>>,
    arrived: Condvar,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        // A panicking producer cannot leave the queue half-written.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, envelope: Envelope) {
        self.lock().push_back(envelope);
        self.arrived.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Takes the oldest message, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Envelope> {
        self.take_first(timeout, |_| true)
    }

    /// Takes the oldest message of `kind` sent by `from`, waiting up to `timeout`.
    /// Other messages keep their place in the queue.
    pub fn take_matching(
        &self,
        from: IpAddr,
        kind: MessageKind,
        timeout: Duration,
    ) -> Option<Envelope> {
        self.take_first(timeout, |e| e.from == from && e.message.kind() == kind)
    }

    fn take_first<F>(&self, timeout: Duration, matches: F) -> Option<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if let Some(pos) = queue.iter().position(&matches) {
                return queue.remove(pos);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            queue = match self.arrived.wait_timeout(queue, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

/// Background acceptor bound to one listening socket.
pub struct ControlServer {
    local_addr: SocketAddr,
    inbox: Arc<Inbox>,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Binds `addr` and starts the acceptor thread. `tick` bounds both a
    /// blocking accept and the read of an accepted connection.
    pub fn bind(addr: SocketAddr, backlog: i32, tick: Duration) -> Result<Self> {
        let listener = net::create_control_listener(addr, backlog, tick)?;
        let local_addr = listener.local_addr()?;
        let inbox = Arc::new(Inbox::new());
        let running = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(true));

        let handle = {
            let inbox = inbox.clone();
            let running = running.clone();
            let alive = alive.clone();
            thread::Builder::new()
                .name(format!("control-{}", local_addr))
                .spawn(move || {
                    accept_loop(listener, &inbox, &running, tick);
                    alive.store(false, Ordering::SeqCst);
                })?
        };

        info!("[Control] Listening on {}", local_addr);

        Ok(ControlServer {
            local_addr,
            inbox,
            running,
            alive,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn inbox(&self) -> Arc<Inbox> {
        self.inbox.clone()
    }

    /// Liveness flag, cleared when the acceptor thread exits.
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stops the acceptor and waits for its thread. A throwaway connection
    /// wakes a pending accept so the stop does not wait for the next tick.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = TcpStream::connect_timeout(&self.local_addr, WAKE_TIMEOUT) {
                debug!("[Control] Wake-up of {} failed: {}", self.local_addr, e);
            }
            if handle.join().is_err() {
                error!("[Control] Acceptor thread panicked");
            }
            info!("[Control] Stopped {}", self.local_addr);
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, inbox: &Inbox, running: &AtomicBool, read_timeout: Duration) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(_) if !running.load(Ordering::SeqCst) => break,
            Ok((stream, peer)) => match read_message(stream, read_timeout) {
                Ok(message) => {
                    debug!("[Control] {} from {}", message.kind(), peer.ip());
                    inbox.push(Envelope {
                        from: peer.ip(),
                        message,
                    });
                }
                Err(e) => debug!("[Control] Dropping message from {}: {}", peer, e),
            },
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("[Control] Socket error: {}", e);
                break;
            }
        }
    }
}

fn read_message(stream: TcpStream, read_timeout: Duration) -> Result<Message> {
    stream.set_read_timeout(Some(read_timeout))?;
    let mut data = Vec::new();
    stream.take(MAX_MESSAGE_SIZE).read_to_end(&mut data)?;
    Message::decode(&data)
}

/// Result of a one-shot control send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    ConnectionRefused,
    Timeout,
    Failed(io::ErrorKind),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }

    fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => SendOutcome::ConnectionRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SendOutcome::Timeout,
            kind => SendOutcome::Failed(kind),
        }
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendOutcome::Sent => f.write_str("sent"),
            SendOutcome::ConnectionRefused => f.write_str("connection refused"),
            SendOutcome::Timeout => f.write_str("timed out"),
            SendOutcome::Failed(kind) => write!(f, "failed ({:?})", kind),
        }
    }
}

/// Sends control messages from a fixed local address to peers' control port.
#[derive(Debug, Clone)]
pub struct ControlClient {
    local: IpAddr,
    port: u16,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(local: IpAddr, port: u16, timeout: Duration) -> Self {
        ControlClient {
            local,
            port,
            timeout,
        }
    }

    pub fn local(&self) -> IpAddr {
        self.local
    }

    /// Connect, write, close. Errors are folded into the returned outcome.
    pub fn send(&self, to: IpAddr, message: &Message) -> SendOutcome {
        let dest = SocketAddr::new(to, self.port);
        let data = match message.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!("[Control] Cannot encode {}: {}", message.kind(), e);
                return SendOutcome::Failed(io::ErrorKind::InvalidData);
            }
        };

        let result = net::connect_from(self.local, dest, self.timeout).and_then(|mut stream| {
            stream.write_all(&data)?;
            stream.shutdown(Shutdown::Write)
        });

        match result {
            Ok(()) => {
                debug!("[Control] {} -> {}", message.kind(), to);
                SendOutcome::Sent
            }
            Err(e) => {
                debug!("[Control] {} -> {} failed: {}", message.kind(), to, e);
                SendOutcome::from_io(&e)
            }
        }
    }
}
