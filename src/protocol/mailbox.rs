use crate::control::{ControlClient, Inbox, SendOutcome};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Message, MessageKind};
use log::{debug, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A node's view of the control channel: selective receive over its inbox and
/// one-shot sends to other nodes.
#[derive(Clone)]
pub struct Mailbox {
    inbox: Arc<Inbox>,
    client: ControlClient,
    acceptor_alive: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    tick: Duration,
    wait_limit: Option<Duration>,
}

impl Mailbox {
    pub fn new(
        inbox: Arc<Inbox>,
        client: ControlClient,
        acceptor_alive: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        tick: Duration,
        wait_limit: Option<Duration>,
    ) -> Self {
        Mailbox {
            inbox,
            client,
            acceptor_alive,
            running,
            tick,
            wait_limit,
        }
    }

    pub fn local(&self) -> IpAddr {
        self.client.local()
    }

    pub fn send(&self, to: IpAddr, message: &Message) -> SendOutcome {
        self.client.send(to, message)
    }

    /// Send whose failure only gets logged.
    pub fn send_best_effort(&self, to: IpAddr, message: &Message) {
        let outcome = self.client.send(to, message);
        if !outcome.is_sent() {
            warn!("[Control] Could not deliver '{}' to {}: {}", message.kind(), to, outcome);
        }
    }

    /// Send whose failure aborts the current phase.
    pub fn send_to_peer(&self, to: IpAddr, message: &Message) -> ProtocolResult<()> {
        match self.client.send(to, message) {
            SendOutcome::Sent => Ok(()),
            outcome => Err(ProtocolError::PeerSend { peer: to, outcome }),
        }
    }

    /// Blocks until `from` sends a message of `kind`. Every tick re-checks that
    /// the local acceptor still runs, the node was not cancelled and the wait
    /// limit has not passed.
    pub fn wait(&self, from: IpAddr, kind: MessageKind) -> ProtocolResult<Message> {
        let started = Instant::now();
        loop {
            if let Some(envelope) = self.inbox.take_matching(from, kind, self.tick) {
                return Ok(envelope.message);
            }
            if !self.running.load(Ordering::SeqCst) {
                return Err(ProtocolError::Cancelled);
            }
            let expired = self
                .wait_limit
                .map(|limit| started.elapsed() >= limit)
                .unwrap_or(false);
            if !self.acceptor_alive.load(Ordering::SeqCst) || expired {
                return Err(ProtocolError::PeerUnreachable {
                    peer: from,
                    awaiting: kind,
                });
            }
            debug!("[Control] Still waiting for '{}' from {}", kind, from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Envelope;

    fn mailbox(inbox: Arc<Inbox>, alive: bool, running: bool, limit: Option<Duration>) -> Mailbox {
        Mailbox::new(
            inbox,
            ControlClient::new("127.0.0.1".parse().unwrap(), 1, Duration::from_millis(100)),
            Arc::new(AtomicBool::new(alive)),
            Arc::new(AtomicBool::new(running)),
            Duration::from_millis(20),
            limit,
        )
    }

    #[test]
    fn test_wait_returns_matching_message() {
        let inbox = Arc::new(Inbox::new());
        let peer: IpAddr = "10.0.0.2".parse().unwrap();
        inbox.push(Envelope {
            from: "10.0.0.3".parse().unwrap(),
            message: Message::Stop { stopped: true },
        });
        inbox.push(Envelope {
            from: peer,
            message: Message::Stop { stopped: false },
        });

        let mb = mailbox(inbox.clone(), true, true, None);
        assert_eq!(
            mb.wait(peer, MessageKind::Stop).unwrap(),
            Message::Stop { stopped: false }
        );
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn test_wait_fails_when_acceptor_dead() {
        let mb = mailbox(Arc::new(Inbox::new()), false, true, None);
        let err = mb
            .wait("10.0.0.2".parse().unwrap(), MessageKind::Finish)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PeerUnreachable {
                awaiting: MessageKind::Finish,
                ..
            }
        ));
    }

    #[test]
    fn test_wait_observes_cancellation() {
        let mb = mailbox(Arc::new(Inbox::new()), true, false, None);
        let err = mb
            .wait("10.0.0.2".parse().unwrap(), MessageKind::Start)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Cancelled));
    }

    #[test]
    fn test_wait_limit_expires() {
        let mb = mailbox(
            Arc::new(Inbox::new()),
            true,
            true,
            Some(Duration::from_millis(60)),
        );
        let started = Instant::now();
        assert!(mb
            .wait("10.0.0.2".parse().unwrap(), MessageKind::Continue)
            .is_err());
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_send_to_peer_reports_failure() {
        let mb = mailbox(Arc::new(Inbox::new()), true, true, None);
        // Nothing listens on port 1.
        let err = mb
            .send_to_peer("127.0.0.1".parse().unwrap(), &Message::Start(None))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PeerSend { .. }));
    }
}
