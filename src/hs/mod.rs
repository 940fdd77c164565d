//! Hidden-service client
//!
//! Resolves a v3 onion address into a ready end-to-end encrypted circuit:
//! blinded-key derivation for the current time period, descriptor fetch
//! from the HSDir ring (verified and decrypted for real, never mocked),
//! rendezvous-point establishment, INTRODUCE1/INTRODUCE_ACK through a
//! separate introduction circuit, and RENDEZVOUS2 completion with the
//! hidden-service ntor variant before the final layer is installed.
//!
//! Circuit building and descriptor fetching enter through capability
//! traits, so the production wiring and the test wiring are two separate
//! composition roots.

pub mod address;
pub mod blinding;
pub mod descriptor;
mod hs_ntor;

pub use address::OnionAddress;
pub use blinding::{
    blind_identity_key, hsdir_candidates, subcredential, TimePeriod, HSDIR_REPLICAS, HSDIR_SPREAD,
};
pub use descriptor::{DescriptorCache, HsDescriptor, IntroPoint};
pub use hs_ntor::{HsNtorClient, HsServiceInfo};

use crate::circuit::{Circuit, CircuitProvider};
use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::guards::GuardStore;
use crate::isolation::IsolationKey;
use crate::path::{
    DirectoryProvider, ExitPolicy, PathSelector, Relay, RelayFlags, RelayId,
};
use crate::protocol::{LinkSpecifier, RelayCell, RelayCommand};
use crate::stream_mux::StreamMultiplexer;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use x25519_dalek::PublicKey;

/// Wait budget for rendezvous-side responses
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);
/// Introduction points tried per connection attempt
const MAX_INTRO_ATTEMPTS: usize = 3;
/// Rendezvous points tried per connection attempt
const MAX_REND_ATTEMPTS: usize = 2;

/// Fetches raw descriptor documents from an HSDir (capability seam; the
/// production implementation goes through a directory circuit)
#[async_trait::async_trait]
pub trait HsDirClient: Send + Sync {
    async fn fetch_descriptor(&self, hsdir: &Relay, blinded: &[u8; 32]) -> Result<String>;
}

/// The hidden-service client
pub struct HsClient {
    config: Arc<TorConfig>,
    provider: Arc<dyn CircuitProvider>,
    directory: Arc<dyn DirectoryProvider>,
    guards: Arc<GuardStore>,
    hsdir_client: Arc<dyn HsDirClient>,
    cache: DescriptorCache,
}

impl HsClient {
    pub fn new(
        config: Arc<TorConfig>,
        provider: Arc<dyn CircuitProvider>,
        directory: Arc<dyn DirectoryProvider>,
        guards: Arc<GuardStore>,
        hsdir_client: Arc<dyn HsDirClient>,
    ) -> Self {
        Self {
            config,
            provider,
            directory,
            guards,
            hsdir_client,
            cache: DescriptorCache::new(),
        }
    }

    /// Resolve `address` into a circuit whose last layer is the service.
    ///
    /// The returned circuit is ready for the multiplexer; streams opened
    /// on it terminate at the hidden service.
    pub async fn connect(&self, address: &OnionAddress) -> Result<Arc<Circuit>> {
        let period = TimePeriod::current();
        let blinded = blind_identity_key(address.pubkey(), &period)?;
        let subcred = subcredential(address.pubkey(), &blinded);

        let descriptor = match self.cache.get(&blinded) {
            Some(descriptor) => {
                log::debug!("descriptor cache hit for {}", address.to_string());
                descriptor
            }
            None => self.fetch_descriptor(&blinded, &subcred, &period).await?,
        };

        self.rendezvous_with(&descriptor, subcred).await
    }

    /// Fetch, verify, and decrypt the descriptor from the HSDir ring.
    /// Candidates are tried in ring order; a candidate that fails to
    /// respond, parse, or verify is skipped. There is no fallback
    /// descriptor of any kind.
    pub(crate) async fn fetch_descriptor(
        &self,
        blinded: &[u8; 32],
        subcred: &[u8; 32],
        period: &TimePeriod,
    ) -> Result<HsDescriptor> {
        let view = self.directory.current_view();
        let selector = PathSelector::new(view);
        let hsdirs = selector.hsdir_candidates();
        let candidates = hsdir_candidates(&hsdirs, blinded, period);
        if candidates.is_empty() {
            return Err(TorError::InsufficientRelays("no HSDir relays".into()));
        }
        log::debug!("{} HSDir candidates on the ring", candidates.len());

        let mut last_error = TorError::DescriptorFetchFailed("no HSDir responded".into());
        for hsdir in &candidates {
            let fetched = timeout(
                self.config.hsdir_fetch_timeout,
                self.hsdir_client.fetch_descriptor(hsdir, blinded),
            )
            .await;

            let text = match fetched {
                Err(_) => {
                    log::debug!("HSDir {} timed out", hsdir.nickname);
                    last_error =
                        TorError::DescriptorFetchFailed(format!("{} timed out", hsdir.nickname));
                    continue;
                }
                Ok(Err(e)) => {
                    log::debug!("HSDir {} fetch failed: {}", hsdir.nickname, e);
                    last_error = e;
                    continue;
                }
                Ok(Ok(text)) => text,
            };

            match descriptor::parse_descriptor(&text, blinded, subcred) {
                Ok(descriptor) => {
                    log::info!(
                        "descriptor fetched from {} ({} intro points, revision {})",
                        hsdir.nickname,
                        descriptor.intro_points.len(),
                        descriptor.revision
                    );
                    self.cache.insert(*blinded, descriptor.clone());
                    return Ok(descriptor);
                }
                Err(e) => {
                    log::warn!("descriptor from {} rejected: {}", hsdir.nickname, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Run the rendezvous protocol against a verified descriptor.
    pub(crate) async fn rendezvous_with(
        &self,
        descriptor: &HsDescriptor,
        subcred: [u8; 32],
    ) -> Result<Arc<Circuit>> {
        let view = self.directory.current_view();
        let selector = PathSelector::new(view);
        let mut last_error = TorError::NoRendezvousReachable;

        for attempt in 0..MAX_REND_ATTEMPTS {
            let rend_relay = selector.pick_rendezvous(&[])?;
            log::debug!(
                "rendezvous attempt {}/{} via {}",
                attempt + 1,
                MAX_REND_ATTEMPTS,
                rend_relay.nickname
            );

            let rend_circuit = match self.build_to(&selector, rend_relay.clone()).await {
                Ok(circuit) => circuit,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            // Establish the rendezvous with a fresh cookie
            let cookie: [u8; 20] = rand::random();
            let establish =
                RelayCell::new(RelayCommand::EstablishRendezvous, 0, cookie.to_vec());
            if let Err(e) = rend_circuit.send_relay(establish, false).await {
                rend_circuit.close().await;
                last_error = e;
                continue;
            }
            match rend_circuit
                .await_control_relay(RelayCommand::RendezvousEstablished, RENDEZVOUS_TIMEOUT)
                .await
            {
                Ok(_) => log::debug!("rendezvous established at {}", rend_relay.nickname),
                Err(e) => {
                    rend_circuit.close().await;
                    last_error = e;
                    continue;
                }
            }

            match self
                .introduce(&selector, descriptor, subcred, &rend_relay, &cookie, &rend_circuit)
                .await
            {
                Ok(circuit) => return Ok(circuit),
                Err(e) => {
                    rend_circuit.close().await;
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Try introduction points until one acknowledges and the service
    /// shows up at the rendezvous.
    async fn introduce(
        &self,
        selector: &PathSelector,
        descriptor: &HsDescriptor,
        subcred: [u8; 32],
        rend_relay: &Relay,
        cookie: &[u8; 20],
        rend_circuit: &Arc<Circuit>,
    ) -> Result<Arc<Circuit>> {
        let mut last_error = TorError::NoIntroPointReachable;

        for intro in descriptor.intro_points.iter().take(MAX_INTRO_ATTEMPTS) {
            let intro_relay = match intro_relay_from(intro, selector) {
                Some(relay) => relay,
                None => {
                    log::debug!("introduction point has no usable address");
                    continue;
                }
            };

            let intro_circuit = match self.build_to(selector, intro_relay.clone()).await {
                Ok(circuit) => circuit,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            let hs_handshake = HsNtorClient::new(HsServiceInfo {
                enc_key: PublicKey::from(intro.enc_key),
                auth_key: intro.auth_key,
                subcredential: subcred,
            });

            let prefix = introduce1_prefix(&intro.auth_key);
            let plaintext = introduce1_plaintext(cookie, rend_relay)?;
            let sealed = match hs_handshake.seal_introduction(&prefix, &plaintext) {
                Ok(sealed) => sealed,
                Err(e) => {
                    intro_circuit.close().await;
                    last_error = e;
                    continue;
                }
            };
            let mut payload = prefix;
            payload.extend_from_slice(&sealed);

            let send = intro_circuit
                .send_relay(RelayCell::new(RelayCommand::Introduce1, 0, payload), false)
                .await;
            if let Err(e) = send {
                intro_circuit.close().await;
                last_error = e;
                continue;
            }

            let ack = intro_circuit
                .await_control_relay(RelayCommand::IntroduceAck, RENDEZVOUS_TIMEOUT)
                .await;
            // The introduction circuit has served its purpose either way
            intro_circuit.close().await;

            match ack {
                Ok(cell) => {
                    let status = match cell.data.as_slice() {
                        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                        _ => u16::MAX,
                    };
                    if status != 0 {
                        log::debug!("introduction point declined with status {}", status);
                        last_error = TorError::NoIntroPointReachable;
                        continue;
                    }
                }
                Err(e) => {
                    last_error = e;
                    continue;
                }
            }

            // The service connects to the rendezvous point
            match rend_circuit
                .await_control_relay(RelayCommand::Rendezvous2, RENDEZVOUS_TIMEOUT)
                .await
            {
                Ok(rend2) => {
                    let keys = hs_handshake.complete(&rend2.data)?;
                    rend_circuit.install_hs_layer(&keys);
                    log::info!("rendezvous complete, end-to-end layer installed");
                    return Ok(Arc::clone(rend_circuit));
                }
                Err(e) => {
                    log::debug!("service never arrived at the rendezvous: {}", e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn build_to(&self, selector: &PathSelector, last: Relay) -> Result<Arc<Circuit>> {
        let guard = self.guards.pick(selector)?;
        let guard_id = guard.identity;
        match self.provider.provide_to_relay(selector, guard, last).await {
            Ok(circuit) => {
                let _ = self.guards.record_success(&guard_id);
                Ok(circuit)
            }
            Err(e) => {
                self.guards.record_failure(&guard_id);
                Err(e)
            }
        }
    }
}

/// INTRODUCE1 plaintext prefix:
/// `LEGACY_KEY_ID (20 zeros) | AUTH_KEY_TYPE (1) | AUTH_KEY_LEN (2) | AUTH_KEY | N_EXTENSIONS (1)`
fn introduce1_prefix(auth_key: &[u8; 32]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(20 + 1 + 2 + 32 + 1);
    prefix.extend_from_slice(&[0u8; 20]);
    prefix.push(0x02); // auth key type: ed25519
    prefix.extend_from_slice(&32u16.to_be_bytes());
    prefix.extend_from_slice(auth_key);
    prefix.push(0); // no extensions
    prefix
}

/// INTRODUCE1 encrypted plaintext:
/// `COOKIE (20) | N_EXTENSIONS (1) | ONION_KEY_TYPE (1) | ONION_KEY_LEN (2) |
///  rendezvous ntor key | link specifiers of the rendezvous point`
fn introduce1_plaintext(cookie: &[u8; 20], rend_relay: &Relay) -> Result<Vec<u8>> {
    let rend_ntor = rend_relay.ntor_onion_key.ok_or_else(|| {
        TorError::BuildFailed(format!("{} has no ntor key", rend_relay.nickname))
    })?;

    let mut specs = Vec::with_capacity(3);
    match rend_relay.address {
        IpAddr::V4(v4) => specs.push(LinkSpecifier::Ipv4(v4, rend_relay.or_port)),
        IpAddr::V6(v6) => specs.push(LinkSpecifier::Ipv6(v6, rend_relay.or_port)),
    }
    specs.push(LinkSpecifier::LegacyId(*rend_relay.identity.as_bytes()));
    if let Some(ed) = rend_relay.ed_identity {
        specs.push(LinkSpecifier::Ed25519Id(ed));
    }

    let mut plaintext = Vec::with_capacity(20 + 1 + 1 + 2 + 32 + 64);
    plaintext.extend_from_slice(cookie);
    plaintext.push(0); // no extensions
    plaintext.push(0x01); // onion key type: ntor
    plaintext.extend_from_slice(&32u16.to_be_bytes());
    plaintext.extend_from_slice(&rend_ntor);
    plaintext.extend_from_slice(&LinkSpecifier::encode_list(&specs));
    Ok(plaintext)
}

/// Resolve an introduction point into a connectable relay: the consensus
/// entry when its identity is known, otherwise a relay synthesized from
/// the descriptor's link specifiers. The onion key always comes from the
/// descriptor, which is fresher than the consensus.
fn intro_relay_from(intro: &IntroPoint, selector: &PathSelector) -> Option<Relay> {
    if let Some(id) = &intro.legacy_identity {
        if let Some(relay) = selector.view().relay_by_id(id) {
            let mut relay = relay.clone();
            relay.ntor_onion_key = Some(intro.onion_key);
            return Some(relay);
        }
    }

    let (address, port) = intro.address?;
    Some(Relay {
        nickname: "intro-point".into(),
        identity: intro.legacy_identity.unwrap_or(RelayId([0u8; 20])),
        ed_identity: intro.ed_identity,
        address,
        or_port: port,
        flags: RelayFlags {
            fast: true,
            running: true,
            stable: true,
            valid: true,
            ..Default::default()
        },
        bandwidth: 0,
        ntor_onion_key: Some(intro.onion_key),
        family: Vec::new(),
        exit_policy: ExitPolicy::default(),
    })
}

/// Production descriptor fetcher: builds a directory circuit to the HSDir
/// and issues the fetch over a BEGIN_DIR stream.
pub struct CircuitHsDirClient {
    provider: Arc<dyn CircuitProvider>,
    directory: Arc<dyn DirectoryProvider>,
    guards: Arc<GuardStore>,
    mux: Arc<StreamMultiplexer>,
}

impl CircuitHsDirClient {
    pub fn new(
        provider: Arc<dyn CircuitProvider>,
        directory: Arc<dyn DirectoryProvider>,
        guards: Arc<GuardStore>,
        mux: Arc<StreamMultiplexer>,
    ) -> Self {
        Self {
            provider,
            directory,
            guards,
            mux,
        }
    }
}

#[async_trait::async_trait]
impl HsDirClient for CircuitHsDirClient {
    async fn fetch_descriptor(&self, hsdir: &Relay, blinded: &[u8; 32]) -> Result<String> {
        let selector = PathSelector::new(self.directory.current_view());
        let guard = self.guards.pick(&selector)?;
        let circuit = self
            .provider
            .provide_to_relay(&selector, guard, hsdir.clone())
            .await?;

        let result = async {
            let mut stream = self
                .mux
                .open_dir_stream(&circuit, IsolationKey::None)
                .await?;

            let request = format!(
                "GET /tor/hs/3/{} HTTP/1.0\r\nHost: {}\r\n\r\n",
                BASE64.encode(blinded),
                hsdir.address
            );
            stream.write_all(request.as_bytes()).await?;

            let response = stream.read_to_end().await?;
            let _ = stream.close().await;
            parse_http_body(&response)
        }
        .await;

        circuit.close().await;
        result
    }
}

/// Strip an HTTP/1.0 response down to its body, requiring a 200
fn parse_http_body(response: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(response);
    let (head, body) = text.split_once("\r\n\r\n").ok_or_else(|| {
        TorError::DescriptorFetchFailed("malformed HTTP response".into())
    })?;
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.contains(" 200") {
        return Err(TorError::DescriptorFetchFailed(format!(
            "HSDir answered: {}",
            status_line
        )));
    }
    Ok(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::test_support::{open_circuit, FakeRelaySide};
    use crate::hs::descriptor::test_support::build_descriptor;
    use crate::hs::hs_ntor::service_side::SimulatedService;
    use crate::path::test_support::test_relay;
    use crate::path::{BandwidthWeights, ConsensusView, SnapshotDirectory};
    use std::sync::Mutex;

    /// Provider handing out scripted circuits and collecting their relay
    /// sides for the test to drive.
    struct ScriptedProvider {
        sides: Mutex<Vec<FakeRelaySide>>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                sides: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl CircuitProvider for ScriptedProvider {
        async fn provide_for_port(
            &self,
            _selector: &PathSelector,
            _guard: Relay,
            _port: u16,
        ) -> Result<Arc<Circuit>> {
            unreachable!("hidden-service client builds to relays")
        }

        async fn provide_to_relay(
            &self,
            _selector: &PathSelector,
            _guard: Relay,
            last: Relay,
        ) -> Result<Arc<Circuit>> {
            let (circuit, side) = open_circuit(last);
            self.sides
                .lock()
                .unwrap()
                .push(FakeRelaySide::new(side, circuit.id()));
            Ok(circuit)
        }
    }

    struct StaticHsDir {
        text: String,
    }

    #[async_trait::async_trait]
    impl HsDirClient for StaticHsDir {
        async fn fetch_descriptor(&self, _hsdir: &Relay, _blinded: &[u8; 32]) -> Result<String> {
            Ok(self.text.clone())
        }
    }

    struct FailingHsDir;

    #[async_trait::async_trait]
    impl HsDirClient for FailingHsDir {
        async fn fetch_descriptor(&self, hsdir: &Relay, _blinded: &[u8; 32]) -> Result<String> {
            Err(TorError::DescriptorFetchFailed(format!(
                "{} unreachable",
                hsdir.nickname
            )))
        }
    }

    fn hs_view() -> ConsensusView {
        let mut relays: Vec<Relay> = (1..=12u8)
            .map(|i| {
                let mut r = test_relay(&format!("relay{}", i), i, [10, i, 0, 1]);
                r.flags.hs_dir = i % 2 == 0;
                r
            })
            .collect();
        relays.push(test_relay("guard", 100, [10, 100, 0, 1]));
        ConsensusView {
            relays,
            weights: BandwidthWeights::default(),
        }
    }

    fn hs_client(provider: Arc<dyn CircuitProvider>, hsdir: Arc<dyn HsDirClient>) -> (HsClient, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let guards = Arc::new(GuardStore::load(dir.path(), 3).unwrap());
        let client = HsClient::new(
            Arc::new(TorConfig::default()),
            provider,
            Arc::new(SnapshotDirectory::new(hs_view())),
            guards,
            hsdir,
        );
        (client, dir)
    }

    #[tokio::test]
    async fn test_fetch_descriptor_verifies_and_caches() {
        let built = build_descriptor(4);
        let (client, _dir) = hs_client(
            Arc::new(ScriptedProvider::new()),
            Arc::new(StaticHsDir {
                text: built.text.clone(),
            }),
        );
        let period = TimePeriod {
            interval_num: 19700,
            length_minutes: 1440,
        };

        let descriptor = client
            .fetch_descriptor(&built.blinded, &built.subcredential, &period)
            .await
            .unwrap();
        assert_eq!(descriptor.revision, 4);
        assert_eq!(client.cache.len(), 1);
        assert!(client.cache.get(&built.blinded).is_some());
    }

    #[tokio::test]
    async fn test_fetch_descriptor_rejects_unverifiable() {
        let built = build_descriptor(4);
        let (client, _dir) = hs_client(
            Arc::new(ScriptedProvider::new()),
            Arc::new(StaticHsDir {
                text: built.text.clone(),
            }),
        );
        let period = TimePeriod {
            interval_num: 19700,
            length_minutes: 1440,
        };

        // Wrong blinded key: every candidate serves a descriptor that
        // fails verification, and there is no mock fallback
        let result = client
            .fetch_descriptor(&[0x12; 32], &built.subcredential, &period)
            .await;
        assert!(result.is_err());
        assert!(client.cache.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_descriptor_all_hsdirs_down() {
        let built = build_descriptor(1);
        let (client, _dir) = hs_client(Arc::new(ScriptedProvider::new()), Arc::new(FailingHsDir));
        let period = TimePeriod {
            interval_num: 19700,
            length_minutes: 1440,
        };
        let result = client
            .fetch_descriptor(&built.blinded, &built.subcredential, &period)
            .await;
        assert!(matches!(result, Err(TorError::DescriptorFetchFailed(_))));
    }

    /// Full rendezvous protocol against a simulated service: establish,
    /// introduce, acknowledge, RENDEZVOUS2, layer installation.
    #[tokio::test]
    async fn test_rendezvous_end_to_end() {
        let service = SimulatedService::new();

        // Descriptor whose enc-key belongs to the simulated service
        let built = crate::hs::descriptor::test_support::build_descriptor_with_enc_key(
            2,
            *PublicKey::from(&service.enc_secret).as_bytes(),
        );
        let descriptor =
            descriptor::parse_descriptor(&built.text, &built.blinded, &built.subcredential)
                .unwrap();

        let provider = Arc::new(ScriptedProvider::new());
        let (client, _dir) = hs_client(
            provider.clone() as Arc<dyn CircuitProvider>,
            Arc::new(FailingHsDir),
        );

        let auth_key = built.auth_key;
        let subcred = built.subcredential;
        let service_subcred_fix = SimulatedService {
            enc_secret: service.enc_secret,
            auth_key,
            subcredential: subcred,
        };

        let client_task = {
            let descriptor = descriptor.clone();
            async move { client.rendezvous_with(&descriptor, subcred).await }
        };

        let relay_task = async move {
            // First circuit: rendezvous point
            let mut rend_side = loop {
                if let Ok(mut sides) = provider.sides.try_lock() {
                    if !sides.is_empty() {
                        break sides.remove(0);
                    }
                }
                tokio::task::yield_now().await;
            };

            let establish = rend_side.recv_relay().await;
            assert_eq!(establish.command, RelayCommand::EstablishRendezvous);
            assert_eq!(establish.data.len(), 20);
            rend_side
                .send_relay(RelayCell::new(
                    RelayCommand::RendezvousEstablished,
                    0,
                    Vec::new(),
                ))
                .await;

            // Second circuit: introduction point
            let mut intro_side = loop {
                if let Ok(mut sides) = provider.sides.try_lock() {
                    if !sides.is_empty() {
                        break sides.remove(0);
                    }
                }
                tokio::task::yield_now().await;
            };

            let introduce1 = intro_side.recv_relay().await;
            assert_eq!(introduce1.command, RelayCommand::Introduce1);
            // Client ephemeral X sits right after the 56-byte prefix
            let x_bytes: [u8; 32] = introduce1.data[56..88].try_into().unwrap();
            let client_x = PublicKey::from(x_bytes);

            intro_side
                .send_relay(RelayCell::new(
                    RelayCommand::IntroduceAck,
                    0,
                    vec![0, 0, 0],
                ))
                .await;

            // The "service" shows up at the rendezvous point
            let (rend2_payload, service_keys) = service_subcred_fix.rendezvous2(&client_x);
            rend_side
                .send_relay(RelayCell::new(RelayCommand::Rendezvous2, 0, rend2_payload))
                .await;
            service_keys
        };

        let (circuit, service_keys) = tokio::join!(client_task, relay_task);
        let circuit = circuit.expect("rendezvous should complete");

        // Three relay hops plus the end-to-end service layer
        assert_eq!(circuit.hop_count(), 4);
        drop(service_keys);
    }

    #[test]
    fn test_introduce1_plaintext_layout() {
        let rend = test_relay("rend", 9, [192, 0, 2, 9]);
        let cookie = [0xFE; 20];
        let plaintext = introduce1_plaintext(&cookie, &rend).unwrap();

        assert_eq!(&plaintext[0..20], &cookie);
        assert_eq!(plaintext[20], 0); // no extensions
        assert_eq!(plaintext[21], 0x01); // ntor onion key
        assert_eq!(&plaintext[22..24], &32u16.to_be_bytes());
        assert_eq!(&plaintext[24..56], &rend.ntor_onion_key.unwrap());
        // Link specifier list follows: ipv4 + legacy + ed = 3 specs
        assert_eq!(plaintext[56], 3);
    }

    #[test]
    fn test_introduce1_prefix_layout() {
        let prefix = introduce1_prefix(&[0xAB; 32]);
        assert_eq!(prefix.len(), 56);
        assert!(prefix[0..20].iter().all(|&b| b == 0));
        assert_eq!(prefix[20], 0x02);
        assert_eq!(&prefix[21..23], &32u16.to_be_bytes());
        assert_eq!(&prefix[23..55], &[0xAB; 32]);
        assert_eq!(prefix[55], 0);
    }

    #[test]
    fn test_parse_http_body() {
        let ok = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(parse_http_body(ok).unwrap(), "hello");

        let not_found = b"HTTP/1.0 404 Not found\r\n\r\n";
        assert!(parse_http_body(not_found).is_err());

        assert!(parse_http_body(b"garbage").is_err());
    }
}
