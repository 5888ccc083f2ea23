//! Listener role.
//!
//! Owns a control acceptor and a probe receiver on the same address. Senders
//! open a flow with `init_stream`, stream UDP probes, then get the flow's
//! (rho, sigma) back in a `close_ack` after `close_stream`.

use crate::config::Config;
use crate::control::{ControlClient, ControlServer, Inbox};
use crate::message::Message;
use crate::receiver::ProbeReceiver;
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Listener {
    server: ControlServer,
    receiver: ProbeReceiver,
    client: ControlClient,
    inbox: Arc<Inbox>,
    expiration: Duration,
}

impl Listener {
    pub fn bind(addr: IpAddr, config: &Config) -> Result<Self> {
        let net = &config.network;
        let server = ControlServer::bind(
            SocketAddr::new(addr, net.control_port),
            net.max_connections,
            net.socket_tick(),
        )?;
        let receiver = ProbeReceiver::bind(
            SocketAddr::new(addr, net.probe_port),
            net.socket_tick(),
            config.pacing.bursts_per_second,
            config.estimation.longest_probe_secs(),
        )?;

        info!("[Listener] Ready on {}", addr);

        Ok(Listener {
            inbox: server.inbox(),
            server,
            receiver,
            client: ControlClient::new(addr, net.control_port, net.connect_timeout()),
            expiration: net.expiration(),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.server.is_alive() && self.receiver.is_alive()
    }

    /// Serves senders until `running` is cleared or one of the two servers
    /// dies. A `close_ack` that cannot be delivered ends the run with an error.
    pub fn run(&mut self, running: Arc<AtomicBool>) -> Result<()> {
        let result = self.serve(&running);
        self.shutdown();
        result
    }

    fn serve(&self, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            let envelope = match self.inbox.recv_timeout(self.expiration) {
                Some(envelope) => envelope,
                None => {
                    if !self.is_alive() {
                        return Err(anyhow!("Listener server thread stopped"));
                    }
                    continue;
                }
            };

            let source = envelope.from;
            match envelope.message {
                Message::InitStream { bandwidth_kbps } => {
                    info!("[Listener] {} streams at {} kbps", source, bandwidth_kbps);
                    self.receiver.open_flow(source, bandwidth_kbps);
                }
                Message::CloseStream => {
                    let result = self.receiver.close_flow(source);
                    if result.is_none() {
                        warn!("[Listener] {} closed a stream it never opened", source);
                    }
                    let outcome = self.client.send(source, &Message::CloseAck(result));
                    if !outcome.is_sent() {
                        return Err(anyhow!("Cannot reply to {}: {}", source, outcome));
                    }
                    info!("[Listener] {} -> {:?}", source, result);
                }
                other => debug!("[Listener] Ignoring '{}' from {}", other.kind(), source),
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        info!("[Listener] Shutting down");
        if !self.inbox.is_empty() {
            warn!("[Listener] Dropping {} unprocessed control messages", self.inbox.len());
        }
        self.server.shutdown();
        self.receiver.shutdown();
    }
}
