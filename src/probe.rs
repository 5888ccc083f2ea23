//! Probe against a remote Listener.
//!
//! One measurement is an `init_stream` / UDP stream / `close_stream` /
//! `close_ack` exchange. Any failure to reach the Listener aborts it.

use crate::config::Config;
use crate::error::{ProtocolError, ProtocolResult};
use crate::flow::Estimate;
use crate::message::{Message, MessageKind};
use crate::pacing;
use crate::packet::PAYLOAD_SIZE;
use crate::protocol::Mailbox;
use crate::traits::Probe;
use log::info;
use std::net::{IpAddr, SocketAddr};
use std::thread;
use std::time::Duration;

pub struct ListenerProbe {
    mailbox: Mailbox,
    listener: IpAddr,
    probe_port: u16,
    bursts_per_second: u64,
    settle: Duration,
    warmup_rate_kbps: u64,
    warmup_secs: u64,
}

impl ListenerProbe {
    pub fn new(mailbox: Mailbox, listener: IpAddr, config: &Config) -> Self {
        ListenerProbe {
            mailbox,
            listener,
            probe_port: config.network.probe_port,
            bursts_per_second: config.pacing.bursts_per_second,
            settle: config.pacing.settle(),
            warmup_rate_kbps: config.pacing.warmup_rate_kbps,
            warmup_secs: config.pacing.warmup_secs,
        }
    }

    fn notify(&self, message: &Message) -> ProtocolResult<()> {
        let outcome = self.mailbox.send(self.listener, message);
        if outcome.is_sent() {
            Ok(())
        } else {
            Err(ProtocolError::ListenerUnreachable {
                listener: self.listener,
                outcome,
            })
        }
    }

    /// Ends the current flow and collects the Listener's verdict on it.
    pub fn close(&self) -> ProtocolResult<Estimate> {
        self.notify(&Message::CloseStream)?;
        match self.mailbox.wait(self.listener, MessageKind::CloseAck)? {
            Message::CloseAck(Some(estimate)) => Ok(estimate),
            _ => Err(ProtocolError::MissingFlow {
                listener: self.listener,
            }),
        }
    }

    fn stream(&self, rate_kbps: u64, duration_secs: u64) -> ProtocolResult<u64> {
        let dest = SocketAddr::new(self.listener, self.probe_port);
        Ok(pacing::send_stream(
            self.mailbox.local(),
            dest,
            rate_kbps,
            duration_secs,
            self.bursts_per_second,
        )?)
    }
}

impl Probe for ListenerProbe {
    fn measure(&mut self, rate_kbps: u64, duration_secs: u64) -> ProtocolResult<Estimate> {
        self.notify(&Message::InitStream {
            bandwidth_kbps: rate_kbps,
        })?;
        thread::sleep(self.settle);

        let sent = self.stream(rate_kbps, duration_secs)?;
        info!(
            "[Probe] {} kbps during {} seconds => {} kbits",
            rate_kbps,
            duration_secs,
            sent * PAYLOAD_SIZE as u64 / 125
        );
        thread::sleep(self.settle);

        self.close()
    }

    fn warm_up(&mut self) -> ProtocolResult<()> {
        if self.warmup_secs > 0 {
            self.stream(self.warmup_rate_kbps, self.warmup_secs)?;
        }
        Ok(())
    }
}
