//! Distributed (rho, sigma) estimation run by every sender.
//!
//! Senders are ordered by the peers file. The run has three phases:
//!
//! 1. Primary estimate: each sender, in index order, finds the rate at which
//!    its path saturates and then the burst tolerance at 1.5x that rate.
//! 2. Synchronized ramp: starting from min(r) / N all senders probe at the
//!    same instants, announced by the last sender, and step their rate up
//!    until every one of them saturates.
//! 3. Pairwise rounds: each sender in turn holds a fixed reference rate while
//!    the others ramp against it.

pub mod mailbox;
pub mod ramp;

pub use mailbox::Mailbox;
pub use ramp::{keeps_up, Ramp, ReferenceRate};

use crate::config::{Config, EstimationConfig};
use crate::control::{ControlClient, ControlServer};
use crate::error::{ProtocolError, ProtocolResult};
use crate::flow::{Estimate, SIGMA_UNDEFINED};
use crate::message::{Message, MessageKind};
use crate::probe::ListenerProbe;
use crate::report::{MeasurementReport, PairEstimate, SharedEstimate};
use crate::traits::Probe;
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

/// Part a sender plays in one barrier round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Announces the probe instants and collects the stop votes.
    Reference,
    /// Follows the announcements and votes.
    Participant,
}

pub struct Estimator<P: Probe> {
    peers: Vec<IpAddr>,
    index: usize,
    probe: P,
    mailbox: Mailbox,
    server: ControlServer,
    settings: EstimationConfig,
    report: MeasurementReport,
}

impl Estimator<ListenerProbe> {
    /// Sender probing the Listener at `listener`.
    pub fn bind(
        source: IpAddr,
        listener: IpAddr,
        peers: Vec<IpAddr>,
        index: usize,
        config: &Config,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        Self::with_probe(source, listener, peers, index, config, running, |mailbox| {
            ListenerProbe::new(mailbox, listener, config)
        })
    }
}

impl<P: Probe> Estimator<P> {
    /// Starts the control acceptor on `source` and builds the probe on top of
    /// the resulting mailbox.
    pub fn with_probe<F>(
        source: IpAddr,
        listener: IpAddr,
        peers: Vec<IpAddr>,
        index: usize,
        config: &Config,
        running: Arc<AtomicBool>,
        make_probe: F,
    ) -> Result<Self>
    where
        F: FnOnce(Mailbox) -> P,
    {
        if peers.get(index) != Some(&source) {
            return Err(anyhow!("{} is not peer #{} of {:?}", source, index, peers));
        }

        let net = &config.network;
        let server = ControlServer::bind(
            SocketAddr::new(source, net.control_port),
            net.max_connections,
            net.socket_tick(),
        )?;
        let client = ControlClient::new(source, net.control_port, net.connect_timeout());
        let mailbox = Mailbox::new(
            server.inbox(),
            client,
            server.alive_flag(),
            running,
            net.expiration(),
            net.wait_limit(),
        );

        Ok(Estimator {
            peers,
            index,
            probe: make_probe(mailbox.clone()),
            mailbox,
            server,
            settings: config.estimation.clone(),
            report: MeasurementReport::new(source, listener),
        })
    }

    pub fn report(&self) -> &MeasurementReport {
        &self.report
    }

    /// Runs all phases. Results of phases completed before a failure stay in
    /// the report; the failing phase leaves nothing behind.
    pub fn run(&mut self) -> ProtocolResult<()> {
        let result = self.run_phases();
        if let Err(e) = &result {
            warn!("[Estimator] Measurement aborted: {}", e);
            self.report.error = Some(e.to_string());
        }
        self.report.completed_at = Some(chrono::Local::now().to_rfc3339());
        result
    }

    /// Stops the control acceptor and hands back the results.
    pub fn close(mut self) -> MeasurementReport {
        self.server.shutdown();
        self.report
    }

    fn run_phases(&mut self) -> ProtocolResult<()> {
        let upstream = self.bootstrap()?;
        self.probe.warm_up()?;

        let primary = primary_estimate(&mut self.probe, &self.settings)?;
        info!("[Phase1] rho = {}, sigma = {}", primary.rho, primary.sigma);
        self.report.primary = Some(primary);

        let floor = self.share_floor(primary, upstream)?;
        if self.peers.len() == 1 {
            return Ok(());
        }

        let shared = self.synchronized_ramp(floor)?;
        info!(
            "[Phase2] rho' = {}, sigma' = {} after {} rounds",
            shared.estimate.rho, shared.estimate.sigma, shared.rounds
        );
        self.report.shared = Some(shared);

        self.report.pairwise = self.pairwise_rounds(shared.estimate)?;
        Ok(())
    }

    fn coordinator(&self) -> IpAddr {
        self.peers[self.peers.len() - 1]
    }

    /// All peers but the one at `skip`.
    fn others(&self, skip: usize) -> Vec<IpAddr> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Waits for the previous sender to hand over, returning the running
    /// minimum rate it passed along.
    fn bootstrap(&self) -> ProtocolResult<Option<u64>> {
        if self.index == 0 {
            return Ok(None);
        }
        let previous = self.peers[self.index - 1];
        info!("[Phase1] Waiting for {} to hand over", previous);
        match self.mailbox.wait(previous, MessageKind::Start)? {
            Message::Start(rate) => Ok(rate),
            _ => Err(unexpected(previous, MessageKind::Start)),
        }
    }

    /// Passes min(r) down the chain; the last sender divides it by N and sends
    /// the floor back to everyone.
    fn share_floor(&self, primary: Estimate, upstream: Option<u64>) -> ProtocolResult<u64> {
        let own = primary.rho.max(0) as u64;
        let minimum = upstream.map_or(own, |rate| rate.min(own));
        let n = self.peers.len();

        if self.index + 1 < n {
            self.mailbox
                .send_to_peer(self.peers[self.index + 1], &Message::Start(Some(minimum)))?;
            let coordinator = self.coordinator();
            return match self.mailbox.wait(coordinator, MessageKind::Finish)? {
                Message::Finish(Some(floor)) => Ok(floor),
                _ => Err(unexpected(coordinator, MessageKind::Finish)),
            };
        }

        let floor = minimum / n as u64;
        let mut failure = None;
        for peer in self.others(self.index) {
            if let Err(e) = self.mailbox.send_to_peer(peer, &Message::Finish(Some(floor))) {
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(floor),
        }
    }

    /// Phase 2, coordinated by the last sender.
    fn synchronized_ramp(&mut self, floor: u64) -> ProtocolResult<SharedEstimate> {
        let n = self.peers.len();
        let coordinator = self.coordinator();
        let role = if self.index == n - 1 {
            Role::Reference
        } else {
            Role::Participant
        };
        let followers = self.others(n - 1);
        let mut ramp = Ramp::new(floor, self.settings.step_kbps, self.settings.alpha);
        let mut proceed = true;
        let mut last = None;
        let mut rounds = 0;

        loop {
            proceed = self.synchronize(role, coordinator, &followers, proceed)?;
            if !proceed {
                break;
            }
            let sample = self.probe.measure(ramp.rate(), self.settings.probe_secs)?;
            debug!("[Phase2] {} kbps -> {:?}", ramp.rate(), sample);
            ramp.observe(sample.rho);
            last = Some(sample);
            rounds += 1;
            proceed = self.tally(role, coordinator, &followers, ramp.stopped())?;
        }

        Ok(SharedEstimate {
            estimate: last.ok_or(ProtocolError::EmptyRound)?,
            rate_kbps: ramp.rate(),
            rounds,
        })
    }

    /// Phase 3: every sender is the reference once, in index order.
    fn pairwise_rounds(&mut self, shared: Estimate) -> ProtocolResult<Vec<PairEstimate>> {
        let mut results = Vec::new();
        for round in 0..self.peers.len() {
            let reference = self.peers[round];
            let others = self.others(round);
            let role = if round == self.index {
                Role::Reference
            } else {
                Role::Participant
            };
            info!("[Phase3] Round {} with reference {} ({:?})", round, reference, role);

            match role {
                Role::Reference => self.lead_reference_round(round, &others)?,
                Role::Participant => {
                    if let Some(pair) = self.follow_reference(reference, &others, shared)? {
                        results.push(pair);
                    }
                }
            }
        }
        Ok(results)
    }

    fn lead_reference_round(&mut self, round: usize, others: &[IpAddr]) -> ProtocolResult<()> {
        if round != 0 {
            self.mailbox.wait(self.peers[round - 1], MessageKind::Finish)?;
        }
        for &peer in others {
            self.mailbox.send_best_effort(peer, &Message::Start(None));
        }

        let own = self.mailbox.local();
        let mut reference = ReferenceRate::new(self.settings.cbr_kbps, self.settings.step_kbps);
        let mut proceed = true;
        loop {
            proceed = self.synchronize(Role::Reference, own, others, proceed)?;
            if !proceed {
                break;
            }
            let sample = self.probe.measure(reference.rate(), self.settings.probe_secs)?;
            reference.observe(sample.rho);
            proceed = self.tally(Role::Reference, own, others, reference.satisfied())?;
        }

        if let Some(&next) = self.peers.get(round + 1) {
            self.mailbox.send_best_effort(next, &Message::Finish(None));
        }
        Ok(())
    }

    fn follow_reference(
        &mut self,
        reference: IpAddr,
        others: &[IpAddr],
        shared: Estimate,
    ) -> ProtocolResult<Option<PairEstimate>> {
        self.mailbox.wait(reference, MessageKind::Start)?;

        let mut ramp = Ramp::new(
            shared.rho.max(0) as u64,
            self.settings.step_kbps,
            self.settings.alpha,
        );
        let mut result = None;
        while self.synchronize(Role::Participant, reference, others, true)? {
            let sample = self.probe.measure(ramp.rate(), self.settings.probe_secs)?;
            ramp.observe(sample.rho);
            result = Some(PairEstimate {
                reference,
                estimate: sample,
            });
            self.tally(Role::Participant, reference, others, ramp.stopped())?;
        }
        Ok(result)
    }

    /// Agrees on the next probe instant. The reference announces `now + lead`
    /// and its `proceed` flag; participants adopt what they are told. Both
    /// sleep until the announced instant.
    fn synchronize(
        &self,
        role: Role,
        leader: IpAddr,
        followers: &[IpAddr],
        proceed: bool,
    ) -> ProtocolResult<bool> {
        match role {
            Role::Reference => {
                let at = SystemTime::now() + self.settings.sync_lead();
                let announcement = Message::Continue { at, proceed };
                for &peer in followers {
                    self.mailbox.send_best_effort(peer, &announcement);
                }
                sleep_until(at);
                Ok(proceed)
            }
            Role::Participant => match self.mailbox.wait(leader, MessageKind::Continue)? {
                Message::Continue { at, proceed } => {
                    sleep_until(at);
                    Ok(proceed)
                }
                _ => Err(unexpected(leader, MessageKind::Continue)),
            },
        }
    }

    /// End of a round. Participants vote; the reference goes on while it or
    /// any participant has not stopped.
    fn tally(
        &self,
        role: Role,
        leader: IpAddr,
        followers: &[IpAddr],
        stopped: bool,
    ) -> ProtocolResult<bool> {
        match role {
            Role::Reference => {
                let mut proceed = !stopped;
                for &peer in followers {
                    match self.mailbox.wait(peer, MessageKind::Stop)? {
                        Message::Stop { stopped } => proceed |= !stopped,
                        _ => return Err(unexpected(peer, MessageKind::Stop)),
                    }
                }
                Ok(proceed)
            }
            Role::Participant => {
                self.mailbox
                    .send_best_effort(leader, &Message::Stop { stopped });
                Ok(true)
            }
        }
    }
}

/// Phase 1 on a single path.
///
/// Multiplies the rate by `growth_factor` until rho falls out of the `alpha`
/// band, then probes at `beta * r` with doubling durations until a loss makes
/// sigma defined. rho is averaged over the saturating probe and the sigma
/// probes.
pub fn primary_estimate<P: Probe + ?Sized>(
    probe: &mut P,
    settings: &EstimationConfig,
) -> ProtocolResult<Estimate> {
    let growth = settings.growth_factor.max(2);
    let mut rate = settings.initial_rate_kbps;
    let mut rho = rate as i64;
    while keeps_up(rho, rate, settings.alpha) {
        rate = rate.saturating_mul(growth);
        rho = probe.measure(rate, settings.probe_secs)?.rho;
        debug!("[Phase1] {} kbps -> rho = {}", rate, rho);
    }
    info!("[Phase1] Path saturated at {} kbps (rho = {})", rate, rho);

    let overdrive = (rho.max(0) as f64 * settings.beta) as u64;
    let mut duration = settings.probe_secs.max(1);
    let mut total = rho;
    let mut samples = 1i64;
    let mut sigma = SIGMA_UNDEFINED;
    while sigma == SIGMA_UNDEFINED {
        if duration > settings.max_sigma_probe_secs {
            warn!("[Phase1] No loss observed up to {}s probes, sigma undefined", duration / 2);
            break;
        }
        let sample = probe.measure(overdrive, duration)?;
        total += sample.rho;
        samples += 1;
        sigma = sample.sigma;
        duration *= 2;
    }

    Ok(Estimate::new(total / samples, sigma))
}

fn sleep_until(at: SystemTime) {
    if let Ok(wait) = at.duration_since(SystemTime::now()) {
        thread::sleep(wait);
    }
}

fn unexpected(peer: IpAddr, awaiting: MessageKind) -> ProtocolError {
    ProtocolError::UnexpectedReply { peer, awaiting }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockProbe;
    use mockall::predicate::*;
    use mockall::Sequence;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    /// Path that carries at most `capacity` kbps and reports loss beyond it.
    struct SaturatingPath {
        capacity: u64,
    }

    impl Probe for SaturatingPath {
        fn measure(&mut self, rate_kbps: u64, _duration_secs: u64) -> ProtocolResult<Estimate> {
            let rho = rate_kbps.min(self.capacity) as i64;
            let sigma = if rate_kbps > self.capacity {
                (rate_kbps - self.capacity) as i64
            } else {
                SIGMA_UNDEFINED
            };
            Ok(Estimate::new(rho, sigma))
        }
    }

    fn settings() -> EstimationConfig {
        EstimationConfig::default()
    }

    fn test_config(port: u16) -> Config {
        let mut config = Config::default();
        config.network.control_port = port;
        config.network.expiration_ms = 20;
        config.network.socket_tick_ms = 500;
        config.network.connect_timeout_ms = 500;
        config.network.wait_limit_secs = Some(20);
        config.estimation.sync_lead_ms = 20;
        config
    }

    fn addresses(base: u8, n: usize) -> Vec<IpAddr> {
        (0..n)
            .map(|k| IpAddr::V4(Ipv4Addr::new(127, 0, 0, base + k as u8)))
            .collect()
    }

    /// Runs one estimator per capacity on 127.0.0.<base + k>, all in parallel.
    fn run_nodes(capacities: &[u64], base: u8, port: u16) -> Vec<(MeasurementReport, bool)> {
        let _ = env_logger::builder().is_test(true).try_init();
        let peers = addresses(base, capacities.len());
        let config = test_config(port);
        let listener: IpAddr = "127.0.0.254".parse().unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let estimators: Vec<_> = capacities
            .iter()
            .enumerate()
            .map(|(k, &capacity)| {
                Estimator::with_probe(
                    peers[k],
                    listener,
                    peers.clone(),
                    k,
                    &config,
                    running.clone(),
                    |_| SaturatingPath { capacity },
                )
                .unwrap()
            })
            .collect();

        let handles: Vec<_> = estimators
            .into_iter()
            .map(|mut estimator| {
                thread::spawn(move || {
                    let ok = estimator.run().is_ok();
                    (estimator.close(), ok)
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_primary_estimate_exponential_then_doubling() {
        let mut probe = MockProbe::new();
        let mut seq = Sequence::new();

        probe
            .expect_measure()
            .with(eq(10_000), eq(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Estimate::new(9_800, -1)));
        probe
            .expect_measure()
            .with(eq(100_000), eq(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Estimate::new(3_000, 1_200)));
        probe
            .expect_measure()
            .with(eq(4_500), eq(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Estimate::new(3_100, -1)));
        probe
            .expect_measure()
            .with(eq(4_500), eq(4))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Estimate::new(2_900, 700)));

        let estimate = primary_estimate(&mut probe, &settings()).unwrap();
        assert_eq!(estimate, Estimate::new(3_000, 700));
    }

    #[test]
    fn test_primary_estimate_gives_up_on_sigma() {
        let mut probe = MockProbe::new();
        probe
            .expect_measure()
            .with(eq(10_000), always())
            .returning(|_, _| Ok(Estimate::new(2_000, 10)));
        probe
            .expect_measure()
            .with(eq(3_000), always())
            .times(3)
            .returning(|_, _| Ok(Estimate::new(2_000, -1)));

        let mut settings = settings();
        settings.max_sigma_probe_secs = 8;
        let estimate = primary_estimate(&mut probe, &settings).unwrap();
        assert_eq!(estimate, Estimate::new(2_000, SIGMA_UNDEFINED));
    }

    #[test]
    fn test_primary_estimate_propagates_probe_failure() {
        let mut probe = MockProbe::new();
        probe
            .expect_measure()
            .returning(|_, _| Err(ProtocolError::MissingFlow {
                listener: "10.0.0.2".parse().unwrap(),
            }));
        assert!(matches!(
            primary_estimate(&mut probe, &settings()),
            Err(ProtocolError::MissingFlow { .. })
        ));
    }

    #[test]
    fn test_estimator_rejects_wrong_index() {
        let peers = addresses(60, 2);
        let result = Estimator::with_probe(
            peers[0],
            peers[1],
            peers.clone(),
            1,
            &test_config(47_060),
            Arc::new(AtomicBool::new(true)),
            |_| MockProbe::new(),
        );
        assert!(result.is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_single_sender_stops_after_primary() {
        let results = run_nodes(&[2_500], 40, 47_040);
        let (report, ok) = &results[0];
        assert!(ok);
        assert_eq!(report.primary, Some(Estimate::new(2_500, 1_250)));
        assert!(report.shared.is_none());
        assert!(report.pairwise.is_empty());
        assert!(report.completed_at.is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_three_senders_complete_all_phases() {
        let capacities = [1_300u64, 1_600, 1_200];
        let results = run_nodes(&capacities, 10, 47_010);
        let peers = addresses(10, capacities.len());

        for (k, (report, ok)) in results.iter().enumerate() {
            assert!(ok, "sender {} failed: {:?}", k, report.error);
            let capacity = capacities[k] as i64;
            assert_eq!(report.primary.unwrap().rho, capacity);

            // Phase 2: the barrier runs until the fastest path saturates,
            // 400 -> 1700 kbps in 100 kbps steps.
            let shared = report.shared.unwrap();
            assert_eq!(shared.rounds, 14);
            assert_eq!(shared.estimate.rho, capacity);
            assert!(shared.rate_kbps as i64 > capacity);
            assert!((shared.rate_kbps as i64 - 100 - capacity).abs() <= 100);

            // Phase 3: one result per other sender, keyed by that sender.
            let references: HashSet<IpAddr> =
                report.pairwise.iter().map(|p| p.reference).collect();
            let expected: HashSet<IpAddr> = peers
                .iter()
                .copied()
                .filter(|p| *p != peers[k])
                .collect();
            assert_eq!(report.pairwise.len(), capacities.len() - 1);
            assert_eq!(references, expected);
            for pair in &report.pairwise {
                assert_eq!(pair.estimate.rho, capacity);
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_successor_keeps_primary_result() {
        // Only the first of two senders runs: phase 1 completes, the hand-off fails.
        let peers = addresses(30, 2);
        let mut estimator = Estimator::with_probe(
            peers[0],
            "127.0.0.254".parse().unwrap(),
            peers.clone(),
            0,
            &test_config(47_030),
            Arc::new(AtomicBool::new(true)),
            |_| SaturatingPath { capacity: 3_000 },
        )
        .unwrap();

        let err = estimator.run().unwrap_err();
        assert!(matches!(err, ProtocolError::PeerSend { .. }));
        let report = estimator.close();
        assert!(report.primary.is_some());
        assert!(report.shared.is_none());
        assert!(report.error.is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_predecessor_times_out() {
        let peers = addresses(50, 2);
        let mut config = test_config(47_050);
        config.network.wait_limit_secs = Some(1);
        let mut estimator = Estimator::with_probe(
            peers[1],
            "127.0.0.254".parse().unwrap(),
            peers.clone(),
            1,
            &config,
            Arc::new(AtomicBool::new(true)),
            |_| MockProbe::new(),
        )
        .unwrap();

        let err = estimator.run().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PeerUnreachable {
                awaiting: MessageKind::Start,
                ..
            }
        ));
        assert!(estimator.close().primary.is_none());
    }
}
