//! UDP probe receiver.
//!
//! Runs on its own thread, stamps every datagram on arrival and hands it to
//! the flow of its source address. Datagrams from sources without an open
//! flow, of the wrong size, or that do not decode, are dropped.

use crate::flow::{Estimate, FlowTable};
use crate::net;
use crate::packet::{self, PACKET_SIZE};
use anyhow::Result;
use log::{debug, error, info};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub struct ProbeReceiver {
    local_addr: SocketAddr,
    flows: Arc<Mutex<FlowTable>>,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProbeReceiver {
    /// Binds `addr` and starts receiving. `tick` bounds how long a stop request
    /// can go unnoticed; `longest_probe_secs` bounds accepted sequence numbers.
    pub fn bind(
        addr: SocketAddr,
        tick: Duration,
        bursts_per_second: u64,
        longest_probe_secs: u64,
    ) -> Result<Self> {
        let socket = net::create_probe_socket(addr, tick)?;
        let local_addr = socket.local_addr()?;
        let flows = Arc::new(Mutex::new(FlowTable::new(bursts_per_second, longest_probe_secs)));
        let running = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(true));

        let handle = {
            let flows = flows.clone();
            let running = running.clone();
            let alive = alive.clone();
            thread::Builder::new()
                .name(format!("receiver-{}", local_addr))
                .spawn(move || {
                    receive_loop(socket, &flows, &running);
                    alive.store(false, Ordering::SeqCst);
                })?
        };

        info!("[Receiver] Listening on {}", local_addr);

        Ok(ProbeReceiver {
            local_addr,
            flows,
            running,
            alive,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn open_flow(&self, source: IpAddr, bandwidth_kbps: u64) {
        lock(&self.flows).open(source, bandwidth_kbps);
        debug!("[Receiver] Flow opened for {} at {} kbps", source, bandwidth_kbps);
    }

    /// Removes the flow of `source` and returns its final (rho, sigma).
    pub fn close_flow(&self, source: IpAddr) -> Option<Estimate> {
        let result = lock(&self.flows).close(source);
        debug!("[Receiver] Flow closed for {}: {:?}", source, result);
        result
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[Receiver] Thread panicked");
            }
            info!("[Receiver] Stopped {}", self.local_addr);
        }
    }
}

impl Drop for ProbeReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(flows: &Mutex<FlowTable>) -> MutexGuard<'_, FlowTable> {
    flows.lock().unwrap_or_else(|e| e.into_inner())
}

fn receive_loop(socket: UdpSocket, flows: &Mutex<FlowTable>, running: &AtomicBool) {
    // One spare byte so oversized datagrams show up as such instead of being
    // truncated to a valid size.
    let mut buf = [0u8; PACKET_SIZE + 1];

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((size, src)) => {
                let arrival = Instant::now();
                if size != PACKET_SIZE {
                    debug!("[Receiver] Dropping {} byte datagram from {}", size, src);
                    continue;
                }
                match packet::decode(&buf[..size]) {
                    Ok(timestamp) => {
                        lock(flows).record(src.ip(), timestamp, arrival);
                    }
                    Err(e) => debug!("[Receiver] Dropping datagram from {}: {}", src, e),
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("[Receiver] Socket error: {}", e);
                break;
            }
        }
    }
}
