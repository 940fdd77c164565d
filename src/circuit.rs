//! Circuit engine
//!
//! Builds and drives multi-hop circuits: the CREATE2/EXTEND2 handshake
//! sequence, the per-circuit reactor that routes demultiplexed cells to
//! streams and control waiters, DESTROY/TRUNCATED handling, flow-control
//! accounting, and rotation bookkeeping.
//!
//! Every mutation of a circuit's cryptographic state happens under one
//! exclusive lock, and the lock is never held across a suspension point:
//! cells are wrapped or unwrapped under the lock, then sent or routed
//! after it is released.

use crate::config::TorConfig;
use crate::error::{EndReason, Result, TorError};
use crate::link::{CircuitMailbox, Link, LinkMsg};
use crate::path::{PathSelector, Relay, RelayId, TorPath};
use crate::protocol::{
    extend2_payload, parse_created2, Cell, CellCommand, CircuitKeys, HopCrypto, HsCircuitKeys,
    LinkSpecifier, NtorHandshake, RelayCell, RelayCommand, RelayPipeline, SendmeWindow,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use x25519_dalek::PublicKey;

/// Budget for a single CREATE2/EXTEND2 round trip
pub const EXTEND_STEP_TIMEOUT: Duration = Duration::from_secs(10);
/// Candidate attempts per path position during a build
const ATTEMPTS_PER_POSITION: usize = 3;
/// Control channel depth (build responses, hidden-service cells)
const CONTROL_QUEUE: usize = 8;

/// Circuit lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Building,
    Open,
    Closing,
    Closed,
    Failed,
}

/// Control-channel message surfaced to whoever is driving the circuit
#[derive(Debug)]
pub enum ControlMsg {
    /// CREATED2 payload received during the first hop handshake
    Created2(Vec<u8>),
    /// A circuit-level relay cell (EXTENDED2, TRUNCATED, rendezvous set)
    Relay(RelayCell),
    /// The circuit is gone
    Closed(TorError),
}

/// Cryptographic state guarded by the circuit's exclusive lock
struct CircuitCrypto {
    pipeline: RelayPipeline,
    window: SendmeWindow,
}

/// Messages delivered to a stream's receive queue
#[derive(Debug)]
pub(crate) enum StreamMsg {
    Connected(Vec<u8>),
    Data(Vec<u8>),
    End(EndReason),
    Resolved(Vec<u8>),
    Failed(TorError),
}

/// Reactor-side record of one stream
pub(crate) struct StreamEntry {
    pub(crate) tx: mpsc::Sender<StreamMsg>,
    pub(crate) window: SendmeWindow,
    pub(crate) window_notify: Arc<Notify>,
}

/// Stream-id allocation and routing table for one circuit
pub(crate) struct StreamMap {
    next_id: u16,
    entries: HashMap<u16, StreamEntry>,
}

/// Stream receive queue depth
const STREAM_QUEUE: usize = 64;

impl StreamMap {
    fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Reserve a fresh non-zero stream id, skipping live ids, wrapping on
    /// overflow.
    pub(crate) fn reserve(
        &mut self,
        window: SendmeWindow,
    ) -> Result<(u16, mpsc::Receiver<StreamMsg>, Arc<Notify>)> {
        if self.entries.len() >= u16::MAX as usize {
            return Err(TorError::Internal("stream ids exhausted".into()));
        }
        loop {
            let id = self.next_id;
            self.next_id = if self.next_id == u16::MAX {
                1
            } else {
                self.next_id + 1
            };
            if id != 0 && !self.entries.contains_key(&id) {
                let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                let notify = Arc::new(Notify::new());
                self.entries.insert(
                    id,
                    StreamEntry {
                        tx,
                        window,
                        window_notify: Arc::clone(&notify),
                    },
                );
                return Ok((id, rx, notify));
            }
        }
    }

    pub(crate) fn remove(&mut self, id: u16) {
        self.entries.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A client circuit over one link
pub struct Circuit {
    id: u32,
    link: Arc<Link>,
    /// Keeps the link's demux entry alive
    _mailbox: Arc<CircuitMailbox>,

    crypto: Mutex<CircuitCrypto>,
    state: Mutex<CircuitState>,
    relays: Mutex<Vec<Relay>>,
    pub(crate) streams: Mutex<StreamMap>,

    /// Receiver for build/rendezvous responses; one driver at a time
    control_rx: tokio::sync::Mutex<mpsc::Receiver<ControlMsg>>,
    control_tx: mpsc::Sender<ControlMsg>,

    /// Woken when the circuit-level package window refills
    package_notify: Notify,

    created_at: Instant,
    dirty_since: Mutex<Option<Instant>>,
}

impl Circuit {
    /// Create a circuit shell on `link` and start its reactor.
    fn start(link: Arc<Link>, first_relay: Relay, config: &TorConfig) -> Arc<Self> {
        let (mailbox, mailbox_rx) = CircuitMailbox::new();
        let id = link.allocate_circuit_id(&mailbox);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);

        let circuit = Arc::new(Self {
            id,
            link,
            _mailbox: mailbox,
            crypto: Mutex::new(CircuitCrypto {
                pipeline: RelayPipeline::new(config.replay_window),
                window: SendmeWindow::circuit_level(
                    config.circuit_package_window,
                    config.circuit_deliver_window,
                ),
            }),
            state: Mutex::new(CircuitState::Building),
            relays: Mutex::new(vec![first_relay]),
            streams: Mutex::new(StreamMap::new()),
            control_rx: tokio::sync::Mutex::new(control_rx),
            control_tx,
            package_notify: Notify::new(),
            created_at: Instant::now(),
            dirty_since: Mutex::new(None),
        });

        let reactor = Arc::clone(&circuit);
        tokio::spawn(async move { reactor.run_reactor(mailbox_rx).await });

        circuit
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn hop_count(&self) -> usize {
        self.crypto.lock().expect("crypto lock poisoned").pipeline.hop_count()
    }

    pub fn relays(&self) -> Vec<Relay> {
        self.relays.lock().expect("relay lock poisoned").clone()
    }

    /// The relay currently at the end of the path
    pub fn last_relay(&self) -> Option<Relay> {
        self.relays.lock().expect("relay lock poisoned").last().cloned()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Mark the circuit as carrying application traffic
    pub fn mark_dirty(&self) {
        let mut dirty = self.dirty_since.lock().expect("dirty lock poisoned");
        if dirty.is_none() {
            *dirty = Some(Instant::now());
        }
    }

    /// How long the circuit has been dirty, if it is
    pub fn dirtiness(&self) -> Option<Duration> {
        self.dirty_since
            .lock()
            .expect("dirty lock poisoned")
            .map(|t| t.elapsed())
    }

    /// Open, and young enough to accept new streams
    pub fn is_usable_for_new_streams(&self, max_dirtiness: Duration) -> bool {
        self.state() == CircuitState::Open
            && !self.link.is_closed()
            && self.dirtiness().map_or(true, |d| d < max_dirtiness)
    }

    // ===== Reactor =====

    async fn run_reactor(self: Arc<Self>, mut mailbox_rx: mpsc::Receiver<LinkMsg>) {
        while let Some(msg) = mailbox_rx.recv().await {
            match msg {
                LinkMsg::Closed(reason) => {
                    self.tear(TorError::LinkDropped(reason), false).await;
                    return;
                }
                LinkMsg::Cell(cell) => {
                    if let Err(e) = self.handle_cell(cell).await {
                        // Fatal protocol or crypto error: tear the circuit
                        log::warn!("circuit {}: fatal error: {}", self.id, e);
                        self.tear(e, true).await;
                        return;
                    }
                }
            }
        }
        // Mailbox drained without a close notice: link went away
        self.tear(TorError::LinkDropped("mailbox closed".into()), false)
            .await;
    }

    async fn handle_cell(&self, cell: Cell) -> Result<()> {
        match cell.command {
            CellCommand::Created2 => {
                let _ = self.control_tx.try_send(ControlMsg::Created2(cell.payload));
                Ok(())
            }
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                log::info!(
                    "circuit {}: DESTROY received ({})",
                    self.id,
                    reason
                );
                self.tear(TorError::circuit_destroyed(reason), false).await;
                Ok(())
            }
            CellCommand::Relay | CellCommand::RelayEarly => self.handle_relay_cell(cell).await,
            other => {
                // Unexpected circuit-level command; drop it
                log::debug!("circuit {}: ignoring {:?}", self.id, other);
                Ok(())
            }
        }
    }

    async fn handle_relay_cell(&self, mut cell: Cell) -> Result<()> {
        // Decrypt and recognise under the crypto lock; route afterwards
        let unwrapped = {
            let mut crypto = self.crypto.lock().expect("crypto lock poisoned");
            crypto.pipeline.process_incoming(&mut cell.payload)
        };

        let (hop, relay_cell) = match unwrapped {
            Ok(result) => result,
            Err(TorError::UnrecognisedCell) => {
                // Not for any hop: drop, do not destroy the circuit
                log::debug!("circuit {}: unrecognised relay cell dropped", self.id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        log::trace!(
            "circuit {}: {:?} from hop {} stream {}",
            self.id,
            relay_cell.command,
            hop,
            relay_cell.stream_id
        );

        if relay_cell.stream_id == 0 {
            self.handle_control_relay(relay_cell).await
        } else {
            self.handle_stream_relay(relay_cell).await
        }
    }

    async fn handle_control_relay(&self, relay_cell: RelayCell) -> Result<()> {
        match relay_cell.command {
            RelayCommand::Sendme => {
                let mut crypto = self.crypto.lock().expect("crypto lock poisoned");
                crypto.window.note_sendme_received();
                drop(crypto);
                self.package_notify.notify_waiters();
                Ok(())
            }
            RelayCommand::Drop => Ok(()), // circuit-level padding
            RelayCommand::Truncated => {
                let reason = relay_cell.data.first().copied().unwrap_or(0);
                let _ = self.control_tx.try_send(ControlMsg::Relay(relay_cell));
                self.tear(TorError::circuit_destroyed(reason), true).await;
                Ok(())
            }
            RelayCommand::Extended2
            | RelayCommand::RendezvousEstablished
            | RelayCommand::IntroduceAck
            | RelayCommand::Rendezvous2 => {
                let _ = self.control_tx.try_send(ControlMsg::Relay(relay_cell));
                Ok(())
            }
            other => {
                log::debug!("circuit {}: dropping control {:?}", self.id, other);
                Ok(())
            }
        }
    }

    async fn handle_stream_relay(&self, relay_cell: RelayCell) -> Result<()> {
        let stream_id = relay_cell.stream_id;

        // Circuit-level deliver accounting for DATA
        let mut owe_circuit_sendme = false;
        if relay_cell.command == RelayCommand::Data {
            let mut crypto = self.crypto.lock().expect("crypto lock poisoned");
            owe_circuit_sendme = crypto.window.note_delivered()?;
        }

        // Stream-level routing under the stream lock, async work after
        let mut forward: Option<(mpsc::Sender<StreamMsg>, StreamMsg)> = None;
        let mut owe_stream_sendme = false;
        let mut stream_finished = false;
        {
            let mut streams = self.streams.lock().expect("stream lock poisoned");
            match streams.entries.get_mut(&stream_id) {
                None => {
                    log::debug!(
                        "circuit {}: cell for unknown stream {} dropped",
                        self.id,
                        stream_id
                    );
                }
                Some(entry) => match relay_cell.command {
                    RelayCommand::Connected => {
                        forward = Some((entry.tx.clone(), StreamMsg::Connected(relay_cell.data)));
                    }
                    RelayCommand::Data => {
                        owe_stream_sendme = entry.window.note_delivered()?;
                        forward = Some((entry.tx.clone(), StreamMsg::Data(relay_cell.data)));
                    }
                    RelayCommand::End => {
                        let reason =
                            EndReason::from_u8(relay_cell.data.first().copied().unwrap_or(1));
                        forward = Some((entry.tx.clone(), StreamMsg::End(reason)));
                        stream_finished = true;
                    }
                    RelayCommand::Sendme => {
                        entry.window.note_sendme_received();
                        entry.window_notify.notify_waiters();
                    }
                    RelayCommand::Resolved => {
                        forward = Some((entry.tx.clone(), StreamMsg::Resolved(relay_cell.data)));
                    }
                    other => {
                        log::debug!(
                            "circuit {}: stream {} ignoring {:?}",
                            self.id,
                            stream_id,
                            other
                        );
                    }
                },
            }
            if stream_finished {
                streams.remove(stream_id);
            }
        }

        if let Some((tx, msg)) = forward {
            // Bounded: a stream the application is not draining eventually
            // back-pressures the reactor, and with it the deliver window
            let _ = tx.send(msg).await;
        }

        if owe_stream_sendme {
            self.send_relay(RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new()), false)
                .await?;
        }
        if owe_circuit_sendme {
            self.send_relay(RelayCell::new(RelayCommand::Sendme, 0, Vec::new()), false)
                .await?;
        }
        Ok(())
    }

    // ===== Sending =====

    /// Wrap and send a relay cell to the end of the path
    pub(crate) async fn send_relay(&self, relay_cell: RelayCell, early: bool) -> Result<()> {
        let cell = {
            let mut crypto = self.crypto.lock().expect("crypto lock poisoned");
            crypto.pipeline.wrap_outgoing(&relay_cell, self.id, early)?
        };
        self.link.send_cell(cell).await
    }

    /// Send a DATA cell, honouring circuit- and stream-level windows.
    ///
    /// Blocks while either package window is exhausted; a SENDME from the
    /// peer wakes the waiters.
    pub(crate) async fn send_stream_data(&self, stream_id: u16, data: Vec<u8>) -> Result<()> {
        // Circuit-level package window
        loop {
            if self.state() != CircuitState::Open {
                return Err(TorError::CircuitClosed("circuit not open".into()));
            }
            let acquired = {
                let mut crypto = self.crypto.lock().expect("crypto lock poisoned");
                if crypto.window.can_package() {
                    crypto.window.note_packaged()?;
                    true
                } else {
                    false
                }
            };
            if acquired {
                break;
            }
            self.package_notify.notified().await;
        }

        // Stream-level package window
        loop {
            let (acquired, notify) = {
                let mut streams = self.streams.lock().expect("stream lock poisoned");
                match streams.entries.get_mut(&stream_id) {
                    None => {
                        return Err(TorError::CircuitClosed(format!(
                            "stream {} gone",
                            stream_id
                        )))
                    }
                    Some(entry) => {
                        if entry.window.can_package() {
                            entry.window.note_packaged()?;
                            (true, None)
                        } else {
                            (false, Some(Arc::clone(&entry.window_notify)))
                        }
                    }
                }
            };
            if acquired {
                break;
            }
            if let Some(notify) = notify {
                notify.notified().await;
            }
        }

        self.send_relay(RelayCell::new(RelayCommand::Data, stream_id, data), false)
            .await
    }

    /// Await the next control message, with a deadline
    pub(crate) async fn next_control(&self, deadline: Duration) -> Result<ControlMsg> {
        let mut rx = self.control_rx.lock().await;
        match timeout(deadline, rx.recv()).await {
            Err(_) => Err(TorError::Timeout("control response".into())),
            Ok(None) => Err(TorError::CircuitClosed("control channel gone".into())),
            Ok(Some(msg)) => Ok(msg),
        }
    }

    /// Await a specific control relay command, treating anything else as a
    /// protocol failure (TRUNCATED carries its own reason)
    pub(crate) async fn await_control_relay(
        &self,
        want: RelayCommand,
        deadline: Duration,
    ) -> Result<RelayCell> {
        let started = Instant::now();
        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or_else(|| TorError::Timeout(format!("waiting for {:?}", want)))?;
            match self.next_control(remaining).await? {
                ControlMsg::Relay(cell) if cell.command == want => return Ok(cell),
                ControlMsg::Relay(cell) if cell.command == RelayCommand::Truncated => {
                    let reason = cell.data.first().copied().unwrap_or(0);
                    return Err(TorError::circuit_destroyed(reason));
                }
                ControlMsg::Relay(cell) => {
                    log::debug!(
                        "circuit {}: ignoring {:?} while waiting for {:?}",
                        self.id,
                        cell.command,
                        want
                    );
                }
                ControlMsg::Created2(_) => {
                    return Err(TorError::ProtocolViolation(
                        "unexpected CREATED2".into(),
                    ));
                }
                ControlMsg::Closed(e) => return Err(e),
            }
        }
    }

    // ===== Handshake steps (driven by the builder) =====

    /// First hop: CREATE2/CREATED2
    async fn create_first_hop(&self, relay: &Relay) -> Result<()> {
        let identity = *relay.identity.as_bytes();
        let onion_key = relay_onion_key(relay)?;

        let handshake = NtorHandshake::new();
        let payload = handshake.create2_payload(&identity, &onion_key);
        self.link
            .send_cell(Cell::new(self.id, CellCommand::Create2, payload))
            .await?;

        let created = match self.next_control(EXTEND_STEP_TIMEOUT).await {
            Ok(ControlMsg::Created2(payload)) => payload,
            Ok(ControlMsg::Closed(e)) => return Err(e),
            Ok(_) => {
                return Err(TorError::ProtocolViolation(
                    "expected CREATED2".into(),
                ))
            }
            Err(TorError::Timeout(_)) => return Err(TorError::HopExtendTimeout(0)),
            Err(e) => return Err(e),
        };

        let (server_public, server_auth) = parse_created2(&created)?;
        let keys = handshake.complete(&identity, &onion_key, &server_public, &server_auth)?;
        self.install_hop(&keys);
        Ok(())
    }

    /// Later hops: EXTEND2/EXTENDED2 inside RELAY_EARLY
    async fn extend_to(&self, relay: &Relay) -> Result<()> {
        let hop_index = self.hop_count();
        let identity = *relay.identity.as_bytes();
        let onion_key = relay_onion_key(relay)?;

        let handshake = NtorHandshake::new();
        let specs = link_specifiers(relay);
        let payload = extend2_payload(&specs, &handshake, &identity, &onion_key);

        self.send_relay(RelayCell::new(RelayCommand::Extend2, 0, payload), true)
            .await?;

        let extended = match self
            .await_control_relay(RelayCommand::Extended2, EXTEND_STEP_TIMEOUT)
            .await
        {
            Ok(cell) => cell,
            Err(TorError::Timeout(_)) => return Err(TorError::HopExtendTimeout(hop_index)),
            Err(e) => return Err(e),
        };

        let (server_public, server_auth) = parse_created2(&extended.data)?;
        let keys = handshake.complete(&identity, &onion_key, &server_public, &server_auth)?;
        self.install_hop(&keys);
        self.relays
            .lock()
            .expect("relay lock poisoned")
            .push(relay.clone());
        Ok(())
    }

    fn install_hop(&self, keys: &CircuitKeys) {
        let mut crypto = self.crypto.lock().expect("crypto lock poisoned");
        crypto.pipeline.add_hop(HopCrypto::ntor(keys));
    }

    /// Install the hidden-service end-to-end layer after a completed
    /// rendezvous handshake
    pub fn install_hs_layer(&self, keys: &HsCircuitKeys) {
        let mut crypto = self.crypto.lock().expect("crypto lock poisoned");
        crypto.pipeline.add_hop(HopCrypto::hs_v3(keys));
    }

    // ===== Teardown =====

    /// Tear the circuit down. `send_destroy` controls whether we notify
    /// the network side.
    pub(crate) async fn tear(&self, error: TorError, send_destroy: bool) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                CircuitState::Closed | CircuitState::Failed => return,
                _ => {
                    *state = match &error {
                        TorError::CircuitDestroyed { .. } => CircuitState::Closed,
                        _ => CircuitState::Failed,
                    }
                }
            }
        }

        if send_destroy && !self.link.is_closed() {
            let _ = self
                .link
                .send_cell(Cell::new(self.id, CellCommand::Destroy, vec![0]))
                .await;
        }

        // Pending streams are torn with the surrounding error
        let entries: Vec<mpsc::Sender<StreamMsg>> = {
            let mut streams = self.streams.lock().expect("stream lock poisoned");
            let txs = streams
                .entries
                .values()
                .map(|e| e.tx.clone())
                .collect();
            streams.entries.clear();
            txs
        };
        for tx in entries {
            let _ = tx.send(StreamMsg::Failed(error.clone())).await;
        }

        let _ = self.control_tx.try_send(ControlMsg::Closed(error));
        self.package_notify.notify_waiters();

        // Drop hop material; key buffers zeroize on drop
        {
            let mut crypto = self.crypto.lock().expect("crypto lock poisoned");
            crypto.pipeline = RelayPipeline::new(1);
        }

        self.link.unregister_circuit(self.id);
    }

    /// Clean shutdown initiated by this side
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                CircuitState::Closed | CircuitState::Failed => return,
                _ => *state = CircuitState::Closing,
            }
        }
        self.tear(TorError::CircuitClosed("closed by client".into()), true)
            .await;
    }
}

fn relay_onion_key(relay: &Relay) -> Result<PublicKey> {
    relay
        .ntor_onion_key
        .map(PublicKey::from)
        .ok_or_else(|| TorError::BuildFailed(format!("{} has no ntor key", relay.nickname)))
}

/// Minimal link-specifier set for a relay: address, legacy identity, and
/// the Ed25519 identity when the consensus carries one
fn link_specifiers(relay: &Relay) -> Vec<LinkSpecifier> {
    let mut specs = Vec::with_capacity(3);
    match relay.address {
        IpAddr::V4(v4) => specs.push(LinkSpecifier::Ipv4(v4, relay.or_port)),
        IpAddr::V6(v6) => specs.push(LinkSpecifier::Ipv6(v6, relay.or_port)),
    }
    specs.push(LinkSpecifier::LegacyId(*relay.identity.as_bytes()));
    if let Some(ed) = relay.ed_identity {
        specs.push(LinkSpecifier::Ed25519Id(ed));
    }
    specs
}

/// How long a (guard, DESTROY reason) pair suppresses re-extension
const DESTROY_COOLDOWN: Duration = Duration::from_secs(10);

/// Builds circuits, reusing links across circuits through the same relay
pub struct CircuitBuilder {
    config: Arc<TorConfig>,
    links: Mutex<HashMap<RelayId, Weak<Link>>>,
    /// Recent DESTROY/TRUNCATED reasons per guard link; the same failure
    /// reason is not retried on the same link within the cooldown
    destroy_reasons: Mutex<HashMap<(RelayId, u8), Instant>>,
}

impl CircuitBuilder {
    pub fn new(config: Arc<TorConfig>) -> Self {
        Self {
            config,
            links: Mutex::new(HashMap::new()),
            destroy_reasons: Mutex::new(HashMap::new()),
        }
    }

    fn destroyed_recently(&self, guard: &RelayId, reason: u8) -> bool {
        let mut reasons = self.destroy_reasons.lock().expect("reason table poisoned");
        reasons.retain(|_, at| at.elapsed() < DESTROY_COOLDOWN);
        reasons.contains_key(&(*guard, reason))
    }

    fn note_destroyed(&self, guard: &RelayId, reason: u8) {
        self.destroy_reasons
            .lock()
            .expect("reason table poisoned")
            .insert((*guard, reason), Instant::now());
    }

    /// An open link to `relay`, reusing one when a healthy link exists
    async fn link_for(&self, relay: &Relay) -> Result<Arc<Link>> {
        if let Some(link) = self
            .links
            .lock()
            .expect("link table poisoned")
            .get(&relay.identity)
            .and_then(Weak::upgrade)
        {
            if !link.is_closed() {
                log::debug!("reusing link to {}", relay.nickname);
                return Ok(link);
            }
        }

        let link = Link::connect(relay).await?;
        let mut links = self.links.lock().expect("link table poisoned");
        links.retain(|_, weak| weak.strong_count() > 0);
        links.insert(relay.identity, Arc::downgrade(&link));
        Ok(link)
    }

    /// Build a circuit along an explicit path, within the configured
    /// total build timeout.
    pub async fn build(&self, path: &TorPath) -> Result<Arc<Circuit>> {
        timeout(self.config.circuit_build_timeout, self.build_inner(path))
            .await
            .map_err(|_| TorError::BuildFailed("circuit build timed out".into()))?
    }

    async fn build_inner(&self, path: &TorPath) -> Result<Arc<Circuit>> {
        let link = self.link_for(&path.guard).await?;
        let circuit = Circuit::start(link, path.guard.clone(), &self.config);

        let result = async {
            circuit.create_first_hop(&path.guard).await?;
            circuit.extend_to(&path.middle).await?;
            circuit.extend_to(&path.exit).await?;
            Ok::<(), TorError>(())
        }
        .await;

        match result {
            Ok(()) => {
                *circuit.state.lock().expect("state lock poisoned") = CircuitState::Open;
                log::info!(
                    "circuit {} open: {} -> {} -> {}",
                    circuit.id(),
                    path.guard.nickname,
                    path.middle.nickname,
                    path.exit.nickname
                );
                Ok(circuit)
            }
            Err(e) => {
                circuit.tear(e.clone(), true).await;
                Err(e)
            }
        }
    }

    /// Build a circuit for `port` through `guard`, asking the selector for
    /// replacement middles and exits on transient failures. No position is
    /// tried more than three times.
    pub async fn build_for_port(
        &self,
        selector: &PathSelector,
        guard: Relay,
        port: u16,
    ) -> Result<Arc<Circuit>> {
        timeout(
            self.config.circuit_build_timeout,
            self.build_with_retries(selector, guard, BuildTarget::Port(port)),
        )
        .await
        .map_err(|_| TorError::BuildFailed("circuit build timed out".into()))?
    }

    /// Build a circuit ending at a specific relay (directory fetches,
    /// rendezvous and introduction circuits).
    pub async fn build_to_relay(
        &self,
        selector: &PathSelector,
        guard: Relay,
        last: Relay,
    ) -> Result<Arc<Circuit>> {
        timeout(
            self.config.circuit_build_timeout,
            self.build_with_retries(selector, guard, BuildTarget::Relay(last)),
        )
        .await
        .map_err(|_| TorError::BuildFailed("circuit build timed out".into()))?
    }

    async fn build_with_retries(
        &self,
        selector: &PathSelector,
        guard: Relay,
        target: BuildTarget,
    ) -> Result<Arc<Circuit>> {
        let mut last_error = TorError::BuildFailed("no candidates tried".into());

        for attempt in 0..ATTEMPTS_PER_POSITION {
            let path = match &target {
                BuildTarget::Port(port) => selector.select_path(guard.clone(), *port),
                BuildTarget::Relay(last) => selector.select_path_to(guard.clone(), last.clone()),
            };
            let path = match path {
                Ok(path) => path,
                Err(e) => return Err(e), // selection failures are not transient
            };

            match self.build_inner(&path).await {
                Ok(circuit) => return Ok(circuit),
                Err(e @ TorError::CircuitDestroyed { reason, .. }) => {
                    // The same path-failure reason is not retried on this
                    // link within a short cooldown
                    if self.destroyed_recently(&guard.identity, reason) {
                        return Err(e);
                    }
                    self.note_destroyed(&guard.identity, reason);
                    log::warn!(
                        "build attempt {}/{} destroyed ({}): retrying with a new path",
                        attempt + 1,
                        ATTEMPTS_PER_POSITION,
                        reason
                    );
                    last_error = e;
                }
                Err(e) if e.is_retryable() => {
                    log::warn!(
                        "build attempt {}/{} failed: {}",
                        attempt + 1,
                        ATTEMPTS_PER_POSITION,
                        e
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}

enum BuildTarget {
    Port(u16),
    Relay(Relay),
}

/// Capability seam for everything that needs circuits built: the pool and
/// the hidden-service client take this as a trait object, so the test
/// composition root can wire in a fake without any production fallback.
#[async_trait::async_trait]
pub trait CircuitProvider: Send + Sync {
    /// A general-purpose circuit whose exit allows `port`
    async fn provide_for_port(
        &self,
        selector: &PathSelector,
        guard: Relay,
        port: u16,
    ) -> Result<Arc<Circuit>>;

    /// A circuit terminating at a specific relay
    async fn provide_to_relay(
        &self,
        selector: &PathSelector,
        guard: Relay,
        last: Relay,
    ) -> Result<Arc<Circuit>>;
}

#[async_trait::async_trait]
impl CircuitProvider for CircuitBuilder {
    async fn provide_for_port(
        &self,
        selector: &PathSelector,
        guard: Relay,
        port: u16,
    ) -> Result<Arc<Circuit>> {
        self.build_for_port(selector, guard, port).await
    }

    async fn provide_to_relay(
        &self,
        selector: &PathSelector,
        guard: Relay,
        last: Relay,
    ) -> Result<Arc<Circuit>> {
        self.build_to_relay(selector, guard, last).await
    }
}

/// Circuit fixtures for unit tests elsewhere in the crate
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::protocol::{CellCodec, LinkVersion, PAYLOAD_LEN};
    use ctr::cipher::StreamCipher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Hop key seeds used by [`open_circuit`]; test harnesses that play
    /// the relay side derive the same keys from these
    pub(crate) const TEST_HOP_SEEDS: [u8; 3] = [11, 12, 13];

    /// Relay-side harness for a scripted circuit: peels the three onion
    /// layers forward and originates backward cells from the exit hop.
    pub(crate) struct FakeRelaySide {
        hops: Vec<HopCrypto>,
        side: DuplexStream,
        codec: CellCodec,
        circuit_id: u32,
    }

    impl FakeRelaySide {
        pub(crate) fn new(side: DuplexStream, circuit_id: u32) -> Self {
            let hops = TEST_HOP_SEEDS
                .iter()
                .map(|seed| HopCrypto::ntor(&CircuitKeys::derive_ntor(&[*seed; 32]).expect("derive")))
                .collect();
            Self {
                hops,
                side,
                codec: CellCodec::new(LinkVersion::V4),
                circuit_id,
            }
        }

        /// Read one RELAY cell and return its fully peeled relay payload
        pub(crate) async fn recv_relay(&mut self) -> RelayCell {
            loop {
                let mut buf = vec![0u8; 4 + 1 + PAYLOAD_LEN];
                self.side.read_exact(&mut buf).await.expect("relay read");
                let cell = self.codec.decode_fixed(&buf).expect("cell");
                if !matches!(cell.command, CellCommand::Relay | CellCommand::RelayEarly) {
                    continue; // skip DESTROYs etc.
                }
                let mut payload = cell.payload;
                for hop in self.hops.iter_mut() {
                    match hop {
                        HopCrypto::Ntor { forward_cipher, .. } => {
                            forward_cipher.apply_keystream(&mut payload)
                        }
                        _ => unreachable!(),
                    }
                }
                return RelayCell::from_bytes(&payload).expect("relay cell");
            }
        }

        /// Originate a backward relay cell from the exit hop
        pub(crate) async fn send_relay(&mut self, relay_cell: RelayCell) {
            let mut payload = relay_cell.to_bytes().expect("serialise");
            payload[1..3].fill(0);
            payload[5..9].fill(0);
            let exit = self.hops.last_mut().expect("hops");
            let digest = exit.update_backward_digest(&payload);
            payload[5..9].copy_from_slice(&digest);
            for hop in self.hops.iter_mut().rev() {
                hop.decrypt_backward(&mut payload);
            }
            let cell = self
                .codec
                .encode(&Cell::relay(self.circuit_id, payload))
                .expect("encode");
            self.side.write_all(&cell).await.expect("write");
            self.side.flush().await.expect("flush");
        }
    }

    /// An Open three-hop circuit over a scripted duplex link. The far end
    /// of the duplex is returned so tests can feed or drain cells.
    pub(crate) fn open_circuit(exit: Relay) -> (Arc<Circuit>, tokio::io::DuplexStream) {
        let (client_side, relay_side) = tokio::io::duplex(1 << 20);
        let link = Link::new_for_test(client_side, LinkVersion::V4);
        let config = TorConfig::default();
        let guard = crate::path::test_support::test_relay("guard", 201, [10, 201, 0, 1]);
        let middle = crate::path::test_support::test_relay("middle", 202, [10, 202, 0, 1]);
        let circuit = Circuit::start(link, guard, &config);

        for seed in TEST_HOP_SEEDS {
            let keys = CircuitKeys::derive_ntor(&[seed; 32]).expect("derive");
            circuit.install_hop(&keys);
        }
        {
            let mut relays = circuit.relays.lock().expect("relay lock");
            relays.push(middle);
            relays.push(exit);
        }
        *circuit.state.lock().expect("state lock") = CircuitState::Open;
        (circuit, relay_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CellCodec, LinkVersion, PAYLOAD_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> TorConfig {
        TorConfig::default()
    }

    fn test_relay(id_byte: u8) -> Relay {
        crate::path::test_support::test_relay("relay", id_byte, [10, id_byte, 0, 1])
    }

    /// Spin up a circuit over a duplex "link" whose far side is scripted
    /// by the test.
    fn scripted_circuit() -> (Arc<Circuit>, tokio::io::DuplexStream) {
        let (client_side, relay_side) = tokio::io::duplex(1 << 20);
        let link = Link::new_for_test(client_side, LinkVersion::V4);
        let circuit = Circuit::start(link, test_relay(1), &test_config());
        (circuit, relay_side)
    }

    #[tokio::test]
    async fn test_destroy_transitions_to_closed() {
        let (circuit, mut relay_side) = scripted_circuit();
        assert_eq!(circuit.state(), CircuitState::Building);

        let codec = CellCodec::new(LinkVersion::V4);
        let destroy = codec
            .encode(&Cell::new(circuit.id(), CellCommand::Destroy, vec![10]))
            .unwrap();
        relay_side.write_all(&destroy).await.unwrap();
        relay_side.flush().await.unwrap();

        // Reactor surfaces the destroy reason on the control channel
        match circuit.next_control(Duration::from_secs(1)).await.unwrap() {
            ControlMsg::Closed(TorError::CircuitDestroyed { reason, reason_name }) => {
                assert_eq!(reason, 10);
                assert_eq!(reason_name, "TIMEOUT");
            }
            other => panic!("expected Closed(CircuitDestroyed), got {:?}", other),
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_circuit_cell_does_not_tear() {
        let (circuit, mut relay_side) = scripted_circuit();

        // A garbage relay cell no hop recognises (circuit has no hops yet,
        // so process_incoming yields UnrecognisedCell)
        let codec = CellCodec::new(LinkVersion::V4);
        let garbage = codec
            .encode(&Cell::relay(circuit.id(), vec![0x77; PAYLOAD_LEN]))
            .unwrap();
        relay_side.write_all(&garbage).await.unwrap();
        relay_side.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(circuit.state(), CircuitState::Building);
    }

    #[tokio::test]
    async fn test_created2_reaches_control_channel() {
        let (circuit, mut relay_side) = scripted_circuit();

        let codec = CellCodec::new(LinkVersion::V4);
        let mut payload = vec![0x00, 0x40];
        payload.extend_from_slice(&[0x99; 64]);
        let created2 = codec
            .encode(&Cell::new(circuit.id(), CellCommand::Created2, payload))
            .unwrap();
        relay_side.write_all(&created2).await.unwrap();
        relay_side.flush().await.unwrap();

        match circuit.next_control(Duration::from_secs(1)).await.unwrap() {
            ControlMsg::Created2(payload) => {
                assert_eq!(&payload[0..2], &[0x00, 0x40]);
            }
            other => panic!("expected Created2, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_id_allocation_skips_live_ids() {
        let (circuit, _relay_side) = scripted_circuit();
        let mut streams = circuit.streams.lock().unwrap();

        let (id1, _rx1, _n1) = streams.reserve(SendmeWindow::stream_level(500, 500)).unwrap();
        let (id2, _rx2, _n2) = streams.reserve(SendmeWindow::stream_level(500, 500)).unwrap();
        assert_ne!(id1, 0);
        assert_ne!(id2, 0);
        assert_ne!(id1, id2);
        assert_eq!(streams.len(), 2);

        streams.remove(id1);
        assert_eq!(streams.len(), 1);
    }

    #[tokio::test]
    async fn test_close_sends_destroy() {
        let (circuit, mut relay_side) = scripted_circuit();
        circuit.close().await;
        assert_eq!(circuit.state(), CircuitState::Closed);

        let codec = CellCodec::new(LinkVersion::V4);
        let mut buf = vec![0u8; 4 + 1 + PAYLOAD_LEN];
        relay_side.read_exact(&mut buf).await.unwrap();
        let cell = codec.decode_fixed(&buf).unwrap();
        assert_eq!(cell.command, CellCommand::Destroy);
        assert_eq!(cell.circuit_id, circuit.id());
    }

    #[tokio::test]
    async fn test_dirtiness_tracking() {
        let (circuit, _relay_side) = scripted_circuit();
        assert!(circuit.dirtiness().is_none());
        circuit.mark_dirty();
        assert!(circuit.dirtiness().is_some());
        // Building circuits are never handed to new streams
        assert!(!circuit.is_usable_for_new_streams(Duration::from_secs(600)));
    }
}
