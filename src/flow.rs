//! Per-source arrival statistics and (rho, sigma) reconstruction.

use crate::pacing::BurstSchedule;
use crate::packet::PAYLOAD_SIZE;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

/// Sigma value meaning "no loss observed, probe longer".
pub const SIGMA_UNDEFINED: i64 = -1;

/// Width of an arrival bucket in seconds.
const BUCKET_SECS: f64 = 1.0;

/// Throughput (kbps) and burst tolerance (kbit) of a probed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estimate {
    pub rho: i64,
    pub sigma: i64,
}

impl Estimate {
    pub fn new(rho: i64, sigma: i64) -> Self {
        Estimate { rho, sigma }
    }

    pub fn sigma_defined(&self) -> bool {
        self.sigma != SIGMA_UNDEFINED
    }
}

/// Statistics of the stream currently arriving from one source.
#[derive(Debug)]
pub struct Flow {
    source: IpAddr,
    bandwidth_kbps: u64,
    schedule: BurstSchedule,
    /// First sequence number no stream of this rate can reach.
    timestamp_limit: u64,
    /// Packets per one-second bucket since the first arrival. Seconds without
    /// any arrival get no bucket of their own.
    buckets: Vec<u64>,
    /// Sequence numbers skipped so far, ascending.
    missing: Vec<u64>,
    /// Highest timestamp accepted in order.
    last_timestamp: u64,
    /// Relative arrival time of `last_timestamp`.
    last_arrival: f64,
    first_arrival: Option<Instant>,
    /// Relative arrival time of the latest datagram.
    elapsed: f64,
}

impl Flow {
    /// `longest_probe_secs` bounds the sequence numbers the flow accepts.
    pub fn new(
        source: IpAddr,
        bandwidth_kbps: u64,
        bursts_per_second: u64,
        longest_probe_secs: u64,
    ) -> Self {
        let schedule = BurstSchedule::new(bandwidth_kbps, bursts_per_second);
        Flow {
            source,
            bandwidth_kbps,
            timestamp_limit: schedule.packets_per_second().saturating_mul(longest_probe_secs),
            schedule,
            buckets: vec![0],
            missing: Vec::new(),
            last_timestamp: 0,
            last_arrival: 0.0,
            first_arrival: None,
            elapsed: 0.0,
        }
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn missing(&self) -> &[u64] {
        &self.missing
    }

    pub fn received(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Timestamp and relative arrival time of the last in-order datagram.
    pub fn last_accepted(&self) -> (u64, f64) {
        (self.last_timestamp, self.last_arrival)
    }

    /// Accounts one datagram. Timestamps beyond the longest possible stream
    /// are dropped and false is returned.
    pub fn add_packet(&mut self, timestamp: u64, arrival: Instant) -> bool {
        if timestamp >= self.timestamp_limit {
            debug!(
                "[Receiver] Dropping timestamp {} from {}: limit is {}",
                timestamp, self.source, self.timestamp_limit
            );
            return false;
        }

        let first = *self.first_arrival.get_or_insert(arrival);
        self.elapsed = arrival.saturating_duration_since(first).as_secs_f64();

        let current = self.buckets.len();
        if self.elapsed < current as f64 * BUCKET_SECS {
            self.buckets[current - 1] += 1;
        } else {
            self.buckets.push(1);
        }

        if timestamp < self.last_timestamp {
            // Late arrival of a sequence number recorded as missing.
            if let Ok(pos) = self.missing.binary_search(&timestamp) {
                self.missing.remove(pos);
            }
        } else if timestamp > self.last_timestamp {
            self.missing.extend(self.last_timestamp + 1..timestamp);
            self.last_timestamp = timestamp;
            self.last_arrival = self.elapsed;
        }
        true
    }

    /// rho = arrived kbits / elapsed seconds. sigma = (bw - rho) * t where t is
    /// the expected send offset of the first missing datagram.
    pub fn compute_result(&self) -> Estimate {
        let kbits = (self.received() * PAYLOAD_SIZE as u64) as f64 / 125.0;
        let rho = if self.elapsed > 0.0 {
            kbits / self.elapsed
        } else {
            0.0
        };

        let sigma = match self.missing.first() {
            Some(&first) => {
                (self.bandwidth_kbps as f64 - rho) * self.schedule.expected_offset(first)
            }
            None => SIGMA_UNDEFINED as f64,
        };

        Estimate::new(rho as i64, sigma as i64)
    }
}

/// All open flows of one receiver, at most one per source.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<IpAddr, Flow>,
    bursts_per_second: u64,
    longest_probe_secs: u64,
}

impl FlowTable {
    pub fn new(bursts_per_second: u64, longest_probe_secs: u64) -> Self {
        FlowTable {
            flows: HashMap::new(),
            bursts_per_second,
            longest_probe_secs,
        }
    }

    /// Opens a flow for `source`, replacing any previous one.
    pub fn open(&mut self, source: IpAddr, bandwidth_kbps: u64) {
        self.flows.insert(
            source,
            Flow::new(
                source,
                bandwidth_kbps,
                self.bursts_per_second,
                self.longest_probe_secs,
            ),
        );
    }

    /// Removes the flow of `source` and returns its final statistics.
    pub fn close(&mut self, source: IpAddr) -> Option<Estimate> {
        self.flows.remove(&source).map(|flow| flow.compute_result())
    }

    /// Routes a datagram to its flow. Returns false when no flow is open or
    /// the flow rejected the datagram.
    pub fn record(&mut self, source: IpAddr, timestamp: u64, arrival: Instant) -> bool {
        match self.flows.get_mut(&source) {
            Some(flow) => flow.add_packet(timestamp, arrival),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    /// Feeds `timestamps` at 10 ms spacing.
    fn feed(flow: &mut Flow, start: Instant, timestamps: &[u64]) {
        for (i, &t) in timestamps.iter().enumerate() {
            flow.add_packet(t, start + Duration::from_millis(10 * i as u64));
        }
    }

    #[test]
    fn test_contiguous_flow_has_no_loss() {
        let mut flow = Flow::new(source(), 1000, 30, 64);
        let timestamps: Vec<u64> = (0..50).collect();
        feed(&mut flow, Instant::now(), &timestamps);

        assert!(flow.missing().is_empty());
        let result = flow.compute_result();
        assert_eq!(result.sigma, SIGMA_UNDEFINED);
        assert!(!result.sigma_defined());
    }

    #[test]
    fn test_single_gap_is_recorded() {
        let mut flow = Flow::new(source(), 1000, 30, 64);
        feed(&mut flow, Instant::now(), &[0, 1, 2, 3, 4, 6, 7, 8, 9]);

        assert_eq!(flow.missing(), &[5]);
        assert_eq!(flow.last_accepted().0, 9);
        let result = flow.compute_result();
        assert!(result.sigma_defined());
    }

    #[test]
    fn test_out_of_range_timestamp_is_dropped() {
        // 1000 kbps for at most 64 s: sequence numbers stay below 6400
        let mut flow = Flow::new(source(), 1000, 30, 64);
        let start = Instant::now();
        assert!(flow.add_packet(0, start));
        assert!(flow.add_packet(1, start + Duration::from_millis(10)));
        assert!(!flow.add_packet(30_000_000, start + Duration::from_millis(20)));
        assert!(!flow.add_packet(6_400, start + Duration::from_millis(30)));

        assert!(flow.missing().is_empty());
        assert_eq!(flow.received(), 2);
        assert_eq!(flow.last_accepted().0, 1);
        assert_eq!(flow.compute_result().sigma, SIGMA_UNDEFINED);

        assert!(flow.add_packet(6_399, start + Duration::from_millis(40)));
        assert_eq!(flow.missing().len(), 6_397);
    }

    #[test]
    fn test_flow_table_rejects_stray_timestamp() {
        let mut table = FlowTable::new(30, 2);
        let now = Instant::now();
        table.open(source(), 1000);
        assert!(table.record(source(), 199, now));
        assert!(!table.record(source(), 200, now));
    }

    #[test]
    fn test_sigma_uses_expected_offset_of_first_gap() {
        // 1000 kbps -> 100 pkt/s in 30 bursts; timestamp 45 sits in burst 11
        let mut flow = Flow::new(source(), 1000, 30, 64);
        let start = Instant::now();
        flow.add_packet(0, start);
        flow.add_packet(44, start + Duration::from_millis(500));
        flow.add_packet(46, start + Duration::from_secs(1));
        for t in 1..44 {
            flow.add_packet(t, start + Duration::from_secs(1));
        }
        assert_eq!(flow.missing(), &[45]);

        let offset = flow.schedule.expected_offset(45);
        assert!((offset - 11.0 / 30.0).abs() < 1e-9);

        // 46 packets = 460 kbit over 1 s
        let result = flow.compute_result();
        assert_eq!(result.rho, 460);
        assert_eq!(result.sigma, ((1000.0 - 460.0) * offset) as i64);
    }

    #[test]
    fn test_reordered_packet_heals_gap() {
        let mut flow = Flow::new(source(), 1000, 30, 64);
        feed(&mut flow, Instant::now(), &[0, 1, 2, 3, 4, 5, 6, 8, 7, 9]);
        assert!(flow.missing().is_empty());
        assert_eq!(flow.last_accepted().0, 9);
    }

    #[test]
    fn test_duplicate_is_ignored_for_loss() {
        let mut flow = Flow::new(source(), 1000, 30, 64);
        feed(&mut flow, Instant::now(), &[0, 1, 2, 2, 3]);
        assert!(flow.missing().is_empty());
        assert_eq!(flow.received(), 5);
    }

    #[test]
    fn test_buckets_split_per_second() {
        let mut flow = Flow::new(source(), 1000, 30, 64);
        let start = Instant::now();
        flow.add_packet(1, start);
        flow.add_packet(2, start + Duration::from_millis(400));
        flow.add_packet(3, start + Duration::from_millis(1200));
        flow.add_packet(4, start + Duration::from_millis(1900));
        assert_eq!(flow.buckets(), &[2, 2]);
    }

    #[test]
    fn test_skipped_seconds_get_no_bucket() {
        let mut flow = Flow::new(source(), 1000, 30, 64);
        let start = Instant::now();
        flow.add_packet(1, start);
        flow.add_packet(2, start + Duration::from_millis(3500));
        // elapsed is 3.5 s but only two buckets exist
        assert_eq!(flow.buckets(), &[1, 1]);
    }

    #[test]
    fn test_rho_in_kbps() {
        let mut flow = Flow::new(source(), 1000, 30, 64);
        let start = Instant::now();
        for t in 0..=100 {
            flow.add_packet(t, start + Duration::from_millis(10 * t));
        }
        // 101 packets * 10 kbit over 1 s
        assert_eq!(flow.compute_result().rho, 1010);
    }

    #[test]
    fn test_empty_flow_reports_zero() {
        let flow = Flow::new(source(), 1000, 30, 64);
        assert_eq!(flow.compute_result(), Estimate::new(0, SIGMA_UNDEFINED));
    }

    #[test]
    fn test_results_are_reproducible() {
        let start = Instant::now();
        let run = || {
            let mut flow = Flow::new(source(), 2000, 30, 64);
            for t in (0..200).filter(|t| t % 7 != 3) {
                flow.add_packet(t, start + Duration::from_micros(4_900 * t));
            }
            flow.compute_result()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_flow_table_routes_by_source() {
        let mut table = FlowTable::new(30, 64);
        let other: IpAddr = "10.0.0.9".parse().unwrap();
        let now = Instant::now();

        assert!(!table.record(source(), 1, now));
        table.open(source(), 1000);
        assert!(table.record(source(), 1, now));
        assert!(!table.record(other, 1, now));
        assert_eq!(table.len(), 1);

        assert!(table.close(source()).is_some());
        assert!(table.close(source()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_flow_table_reopen_replaces_flow() {
        let mut table = FlowTable::new(30, 64);
        let now = Instant::now();
        table.open(source(), 1000);
        table.record(source(), 5, now);
        table.open(source(), 2000);
        assert_eq!(table.len(), 1);
        assert_eq!(table.close(source()), Some(Estimate::new(0, SIGMA_UNDEFINED)));
    }
}
