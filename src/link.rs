//! Link transport
//!
//! One TLS connection to one relay, shared by many circuits. The link
//! negotiates the protocol version (VERSIONS), validates the CERTS cell,
//! exchanges NETINFO, and then runs one reader task and one writer task.
//! Incoming cells are demultiplexed to circuits by circuit-id through a
//! table of weak references; outgoing cells funnel through a bounded
//! queue, so back-pressure from the socket propagates to circuits.
//!
//! Certificate validation accepts self-signed relay certificates; trust is
//! anchored in the consensus-known relay identity, which the CERTS cell is
//! checked against.

use crate::error::{Result, TorError};
use crate::path::{Relay, RelayId};
use crate::protocol::{Cell, CellCodec, CellCommand, CertsCell, LinkVersion};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// TCP connect budget
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for TLS plus the in-protocol link handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle keepalive interval (PADDING cells)
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Peer clock skew beyond which NETINFO draws a warning
const NETINFO_SKEW_WARN: u64 = 3600;

/// Outbound cell queue depth per link
const OUTBOUND_QUEUE: usize = 64;
/// Inbound cell queue depth per circuit mailbox
const MAILBOX_QUEUE: usize = 32;

/// Message delivered to a circuit's mailbox
#[derive(Debug)]
pub enum LinkMsg {
    /// A cell addressed to this circuit
    Cell(Cell),
    /// The link died; no further cells will arrive
    Closed(String),
}

/// Per-circuit inbound queue. The circuit owns the receiving end and an
/// `Arc` of this; the link's demux table holds only a `Weak`.
pub struct CircuitMailbox {
    tx: mpsc::Sender<LinkMsg>,
}

impl CircuitMailbox {
    /// Create a mailbox and its receiver
    pub fn new() -> (Arc<Self>, mpsc::Receiver<LinkMsg>) {
        let (tx, rx) = mpsc::channel(MAILBOX_QUEUE);
        (Arc::new(Self { tx }), rx)
    }
}

/// A TLS connection to one relay
pub struct Link {
    peer: RelayId,
    peer_addr: SocketAddr,
    version: LinkVersion,
    codec: CellCodec,
    outbound_tx: mpsc::Sender<Cell>,
    circuits: Mutex<HashMap<u32, Weak<CircuitMailbox>>>,
    closed: AtomicBool,
    padding_seen: AtomicU64,
}

impl Link {
    /// Connect to a relay and run the link handshake.
    pub async fn connect(relay: &Relay) -> Result<Arc<Self>> {
        let addr = relay.socket_addr();
        log::info!("connecting link to {} at {}", relay.nickname, addr);

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TorError::ConnectTimeout(format!("{}", addr)))?
            .map_err(|e| TorError::ConnectTimeout(format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true)
            .map_err(|e| TorError::LinkDropped(format!("set_nodelay: {}", e)))?;

        let connector = tls_connector();
        let server_name = ServerName::IpAddress(relay.address.into());
        let mut tls = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| TorError::TlsHandshakeFailure("TLS handshake timed out".into()))?
            .map_err(|e| TorError::TlsHandshakeFailure(e.to_string()))?;

        let version = timeout(HANDSHAKE_TIMEOUT, link_handshake(&mut tls, relay))
            .await
            .map_err(|_| TorError::TlsHandshakeFailure("link handshake timed out".into()))??;

        log::info!(
            "link to {} established, protocol v{}",
            relay.nickname,
            version.as_u16()
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let link = Arc::new(Self {
            peer: relay.identity,
            peer_addr: addr,
            version,
            codec: CellCodec::new(version),
            outbound_tx,
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            padding_seen: AtomicU64::new(0),
        });

        let (read_half, write_half) = tokio::io::split(tls);
        link.spawn_io(read_half, write_half, outbound_rx);

        Ok(link)
    }

    /// Build a link over an arbitrary stream with a fixed version, skipping
    /// the handshake. Test composition root only.
    #[cfg(test)]
    pub(crate) fn new_for_test<S>(stream: S, version: LinkVersion) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let link = Arc::new(Self {
            peer: RelayId([0u8; 20]),
            peer_addr: "127.0.0.1:0".parse().expect("literal addr"),
            version,
            codec: CellCodec::new(version),
            outbound_tx,
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            padding_seen: AtomicU64::new(0),
        });
        let (read_half, write_half) = tokio::io::split(stream);
        link.spawn_io(read_half, write_half, outbound_rx);
        link
    }

    fn spawn_io<R, W>(self: &Arc<Self>, read_half: R, mut write_half: W, mut outbound_rx: mpsc::Receiver<Cell>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Reader: drain the socket and dispatch by circuit-id
        let reader_link = Arc::clone(self);
        tokio::spawn(async move {
            let mut read_half = read_half;
            let reason = loop {
                match reader_link.codec.read_cell(&mut read_half).await {
                    Ok(cell) => {
                        if let Err(reason) = reader_link.dispatch(cell).await {
                            break reason;
                        }
                    }
                    Err(e) => break e.to_string(),
                }
            };
            reader_link.mark_closed(&reason).await;
        });

        // Writer: serialise outgoing cells; keepalive padding when idle
        let writer_link = Arc::clone(self);
        tokio::spawn(async move {
            let padding = Cell::new(0, CellCommand::Padding, Vec::new());
            loop {
                let cell = match timeout(KEEPALIVE_INTERVAL, outbound_rx.recv()).await {
                    Ok(Some(cell)) => cell,
                    Ok(None) => break, // all senders gone
                    Err(_) => padding.clone(),
                };
                let bytes = match writer_link.codec.encode(&cell) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("dropping unencodable cell: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&bytes).await {
                    writer_link.mark_closed(&format!("write failed: {}", e)).await;
                    break;
                }
                if let Err(e) = write_half.flush().await {
                    writer_link.mark_closed(&format!("flush failed: {}", e)).await;
                    break;
                }
            }
        });
    }

    /// Route one inbound cell. Returns Err only for link-fatal conditions.
    async fn dispatch(&self, cell: Cell) -> std::result::Result<(), String> {
        match cell.command {
            CellCommand::Padding | CellCommand::Vpadding => {
                self.padding_seen.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            _ => {}
        }

        if cell.circuit_id == 0 {
            // Post-handshake circuit-0 traffic other than padding is noise
            log::debug!("dropping circuit-0 cell {:?}", cell.command);
            return Ok(());
        }

        let mailbox = {
            let mut circuits = self.circuits.lock().expect("circuit table poisoned");
            match circuits.get(&cell.circuit_id) {
                Some(weak) => match weak.upgrade() {
                    Some(mailbox) => Some(mailbox),
                    None => {
                        // Circuit is gone; drop the stale entry
                        circuits.remove(&cell.circuit_id);
                        None
                    }
                },
                None => None,
            }
        };

        match mailbox {
            Some(mailbox) => {
                // Bounded send: a slow circuit back-pressures the reader
                if mailbox.tx.send(LinkMsg::Cell(cell)).await.is_err() {
                    // Receiver dropped between lookup and send; not fatal
                }
                Ok(())
            }
            None => {
                log::debug!("dropping cell for unknown circuit {}", cell.circuit_id);
                Ok(())
            }
        }
    }

    async fn mark_closed(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("link to {} closed: {}", self.peer, reason);

        let mailboxes: Vec<Arc<CircuitMailbox>> = {
            let circuits = self.circuits.lock().expect("circuit table poisoned");
            circuits.values().filter_map(Weak::upgrade).collect()
        };
        for mailbox in mailboxes {
            let _ = mailbox.tx.send(LinkMsg::Closed(reason.to_string())).await;
        }
    }

    /// Queue a cell for transmission, blocking when the link is congested
    pub async fn send_cell(&self, cell: Cell) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TorError::LinkDropped("link closed".into()));
        }
        self.outbound_tx
            .send(cell)
            .await
            .map_err(|_| TorError::LinkDropped("link writer gone".into()))
    }

    /// Mint a fresh client-side circuit-id and register the mailbox.
    ///
    /// Client-minted ids carry the high bit; collisions within the link
    /// are retried.
    pub fn allocate_circuit_id(&self, mailbox: &Arc<CircuitMailbox>) -> u32 {
        let mut circuits = self.circuits.lock().expect("circuit table poisoned");
        loop {
            let id = match self.version {
                LinkVersion::V3 => (rand::random::<u16>() | 0x8000) as u32,
                _ => rand::random::<u32>() | 0x8000_0000,
            };
            if !circuits.contains_key(&id) {
                circuits.insert(id, Arc::downgrade(mailbox));
                return id;
            }
        }
    }

    /// Drop a circuit from the demux table
    pub fn unregister_circuit(&self, circuit_id: u32) {
        self.circuits
            .lock()
            .expect("circuit table poisoned")
            .remove(&circuit_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> LinkVersion {
        self.version
    }

    pub fn peer(&self) -> &RelayId {
        &self.peer
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Registered circuits (live entries only)
    pub fn circuit_count(&self) -> usize {
        self.circuits
            .lock()
            .expect("circuit table poisoned")
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// Run the in-protocol link handshake: VERSIONS, CERTS, AUTH_CHALLENGE,
/// NETINFO. Returns the negotiated version.
async fn link_handshake<S>(stream: &mut S, relay: &Relay) -> Result<LinkVersion>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // VERSIONS is exchanged with the v3 framing (2-byte circuit ids)
    let v3_codec = CellCodec::new(LinkVersion::V3);
    let our_versions: Vec<u16> = vec![3, 4, 5];
    let mut versions_payload = Vec::with_capacity(6);
    for v in &our_versions {
        versions_payload.extend_from_slice(&v.to_be_bytes());
    }
    let versions_cell = Cell::new(0, CellCommand::Versions, versions_payload);
    stream
        .write_all(&v3_codec.encode(&versions_cell)?)
        .await
        .map_err(|e| TorError::LinkDropped(format!("send VERSIONS: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| TorError::LinkDropped(format!("flush VERSIONS: {}", e)))?;

    let peer_versions_cell = v3_codec.read_cell(stream).await?;
    if peer_versions_cell.command != CellCommand::Versions {
        return Err(TorError::ProtocolViolation(format!(
            "expected VERSIONS, got {:?}",
            peer_versions_cell.command
        )));
    }
    if peer_versions_cell.payload.len() % 2 != 0 {
        return Err(TorError::ProtocolViolation(
            "VERSIONS payload length must be even".into(),
        ));
    }
    let peer_versions: Vec<u16> = peer_versions_cell
        .payload
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    let version = LinkVersion::negotiate(&our_versions, &peer_versions)?;
    log::debug!(
        "negotiated link protocol v{} (peer offered {:?})",
        version.as_u16(),
        peer_versions
    );

    // The rest of the handshake uses the negotiated framing
    let codec = CellCodec::new(version);
    let mut certs_seen = false;

    loop {
        let cell = codec.read_cell(stream).await?;
        match cell.command {
            CellCommand::Certs => {
                let certs = CertsCell::parse(&cell.payload)?;
                certs.verify_chain(relay.ed_identity.as_ref())?;
                certs_seen = true;
                log::debug!(
                    "CERTS verified ({} certificates)",
                    certs.certificates.len()
                );
            }
            CellCommand::AuthChallenge => {
                // Clients do not authenticate; acknowledge by ignoring
                log::trace!("ignoring AUTH_CHALLENGE ({} bytes)", cell.payload.len());
            }
            CellCommand::Netinfo => {
                if !certs_seen {
                    return Err(TorError::ProtocolViolation(
                        "NETINFO before CERTS".into(),
                    ));
                }
                check_netinfo_skew(&cell.payload);
                break;
            }
            other => {
                return Err(TorError::ProtocolViolation(format!(
                    "unexpected {:?} during link handshake",
                    other
                )));
            }
        }
    }

    // Our NETINFO: wall-clock time plus the peer's canonical address.
    let netinfo = build_netinfo(relay.address);
    stream
        .write_all(&codec.encode(&netinfo)?)
        .await
        .map_err(|e| TorError::LinkDropped(format!("send NETINFO: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| TorError::LinkDropped(format!("flush NETINFO: {}", e)))?;

    Ok(version)
}

/// Build our NETINFO cell: timestamp, the peer's address, no self addresses
fn build_netinfo(peer_addr: IpAddr) -> Cell {
    let mut payload = Vec::new();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    payload.extend_from_slice(&now.to_be_bytes());
    match peer_addr {
        IpAddr::V4(v4) => {
            payload.push(0x04);
            payload.push(4);
            payload.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            payload.push(0x06);
            payload.push(16);
            payload.extend_from_slice(&v6.octets());
        }
    }
    payload.push(0); // we advertise no addresses of our own
    Cell::new(0, CellCommand::Netinfo, payload)
}

/// Warn about gross clock skew reported by the peer's NETINFO
fn check_netinfo_skew(payload: &[u8]) {
    if payload.len() < 4 {
        return;
    }
    let peer_time = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let skew = now.abs_diff(peer_time);
    if peer_time != 0 && skew > NETINFO_SKEW_WARN {
        log::warn!("peer NETINFO clock skew of {}s", skew);
    }
}

/// TLS connector accepting self-signed relay certificates
fn tls_connector() -> tokio_rustls::TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(RelayCertVerifier))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Relay certificates are self-signed; identity is proven inside the
/// protocol by the CERTS cell against the consensus. This verifier only
/// requires a structurally plausible DER certificate.
#[derive(Debug)]
struct RelayCertVerifier;

impl ServerCertVerifier for RelayCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        // Minimal structural check: a DER SEQUENCE of plausible length
        if end_entity.len() < 64 || end_entity[0] != 0x30 {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
