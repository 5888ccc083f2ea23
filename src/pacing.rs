//! Paced UDP probe streams.
//!
//! A stream of `rate` kbps is sent as a whole number of datagrams per second,
//! split into `bursts_per_second` bursts. The same schedule is replayed by the
//! receiver to map a sequence timestamp back to its expected send offset.

use crate::packet::{ProbePacket, PAYLOAD_KBITS};
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

/// Default burst frequency, close to video frame rates.
pub const DEFAULT_BURSTS_PER_SECOND: u64 = 30;

/// How the datagrams of one second are distributed over its bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstSchedule {
    bursts_per_second: u64,
    packets_per_second: u64,
    /// Packets in a short burst.
    per_burst: u64,
    /// Number of leading bursts carrying one extra packet.
    remainder: u64,
}

impl BurstSchedule {
    /// Never fewer packets per second than bursts, so bursts stay evenly spaced
    /// at low rates.
    pub fn new(rate_kbps: u64, bursts_per_second: u64) -> Self {
        let bursts_per_second = bursts_per_second.max(1);
        let packets_per_second = bursts_per_second.max(rate_kbps / PAYLOAD_KBITS);
        BurstSchedule {
            bursts_per_second,
            packets_per_second,
            per_burst: packets_per_second / bursts_per_second,
            remainder: packets_per_second % bursts_per_second,
        }
    }

    pub fn packets_per_second(&self) -> u64 {
        self.packets_per_second
    }

    pub fn bursts_per_second(&self) -> u64 {
        self.bursts_per_second
    }

    pub fn burst_interval(&self) -> Duration {
        Duration::from_secs(1) / self.bursts_per_second as u32
    }

    /// Datagrams in burst `index` (0-based within a second).
    pub fn burst_len(&self, index: u64) -> u64 {
        if index < self.remainder {
            self.per_burst + 1
        } else {
            self.per_burst
        }
    }

    /// Expected send offset in seconds of the datagram with sequence `timestamp`,
    /// counted in whole burst intervals from the first datagram.
    pub fn expected_offset(&self, timestamp: u64) -> f64 {
        let interval = 1.0 / self.bursts_per_second as f64;
        let seconds = timestamp / self.packets_per_second;
        let mut rest = timestamp - seconds * self.packets_per_second;
        let mut offset = seconds as f64;

        let long_bursts = self.remainder * (self.per_burst + 1);
        if rest < long_bursts {
            offset += (rest / (self.per_burst + 1)) as f64 * interval;
        } else {
            offset += self.remainder as f64 * interval;
            rest -= long_bursts;
            offset += (rest / self.per_burst) as f64 * interval;
        }
        offset
    }
}

/// Sends a paced stream towards `dest` from the `local` address.
///
/// Returns the number of datagrams sent. Any socket error aborts the stream.
/// Pacing is best effort: each burst sleeps out the rest of its interval but
/// lateness is never made up.
pub fn send_stream(
    local: IpAddr,
    dest: SocketAddr,
    rate_kbps: u64,
    duration_secs: u64,
    bursts_per_second: u64,
) -> io::Result<u64> {
    let socket = bind_sender(local)?;
    let schedule = BurstSchedule::new(rate_kbps, bursts_per_second);
    let interval = schedule.burst_interval();
    let mut packet = ProbePacket::new();
    let mut timestamp = 0u64;

    debug!(
        "[Pacing] Streaming {} kbps to {} for {}s ({} pkt/s)",
        rate_kbps,
        dest,
        duration_secs,
        schedule.packets_per_second()
    );

    for _ in 0..duration_secs {
        for burst in 0..schedule.bursts_per_second() {
            let started = Instant::now();
            for _ in 0..schedule.burst_len(burst) {
                packet.set_timestamp(timestamp);
                socket.send_to(packet.as_bytes(), dest)?;
                timestamp += 1;
            }
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    Ok(timestamp)
}

fn bind_sender(local: IpAddr) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(local, 0);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
