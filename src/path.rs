//! Relay view and path selection
//!
//! The consensus view consumed from the directory collaborator, and the
//! selection of (guard, middle, exit) triples from it: positional flag
//! filters, bandwidth weighting with the consensus position weights, and
//! the diversity rules (distinct relays, distinct /16 networks, distinct
//! declared families).

use crate::error::{Result, TorError};
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

/// A relay identity fingerprint (SHA-1 of the RSA identity key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayId(pub [u8; 20]);

impl RelayId {
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| TorError::Internal(format!("bad fingerprint hex: {}", e)))?;
        if bytes.len() != 20 {
            return Err(TorError::Internal(format!(
                "fingerprint must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs
        write!(f, "${}…", hex::encode(&self.0[..4]))
    }
}

/// Relay flags from the consensus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayFlags {
    pub authority: bool,
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hs_dir: bool,
    pub running: bool,
    pub stable: bool,
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from a consensus "s" line
    pub fn from_line(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();
        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => relay_flags.authority = true,
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "HSDir" => relay_flags.hs_dir = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "Valid" => relay_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }
        relay_flags
    }
}

/// Exit policy as a port summary ("accept 80,443,8000-8999")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPolicy {
    /// Whether `ranges` lists accepted ports (otherwise rejected ports)
    accept: bool,
    /// Inclusive port ranges
    ranges: Vec<(u16, u16)>,
}

impl Default for ExitPolicy {
    /// Reject everything
    fn default() -> Self {
        Self {
            accept: true,
            ranges: Vec::new(),
        }
    }
}

impl ExitPolicy {
    /// Parse a consensus port summary line
    pub fn from_summary(summary: &str) -> Result<Self> {
        let summary = summary.trim();
        let (accept, list) = if let Some(rest) = summary.strip_prefix("accept ") {
            (true, rest)
        } else if let Some(rest) = summary.strip_prefix("reject ") {
            (false, rest)
        } else {
            return Err(TorError::Internal(format!(
                "bad exit policy summary: {}",
                summary
            )));
        };

        let mut ranges = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: u16 = lo
                    .parse()
                    .map_err(|_| TorError::Internal(format!("bad port range: {}", part)))?;
                let hi: u16 = hi
                    .parse()
                    .map_err(|_| TorError::Internal(format!("bad port range: {}", part)))?;
                ranges.push((lo, hi));
            } else {
                let port: u16 = part
                    .parse()
                    .map_err(|_| TorError::Internal(format!("bad port: {}", part)))?;
                ranges.push((port, port));
            }
        }

        Ok(Self { accept, ranges })
    }

    /// Accept everything (used by tests and directory streams)
    pub fn accept_all() -> Self {
        Self {
            accept: true,
            ranges: vec![(1, 65535)],
        }
    }

    pub fn allows_port(&self, port: u16) -> bool {
        let listed = self
            .ranges
            .iter()
            .any(|(lo, hi)| port >= *lo && port <= *hi);
        if self.accept {
            listed
        } else {
            !listed
        }
    }
}

/// A relay from the consensus view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    pub nickname: String,
    pub identity: RelayId,
    /// Ed25519 identity, when the consensus carries one
    pub ed_identity: Option<[u8; 32]>,
    pub address: IpAddr,
    pub or_port: u16,
    pub flags: RelayFlags,
    /// Advertised bandwidth weight
    pub bandwidth: u64,
    /// ntor onion key
    pub ntor_onion_key: Option<[u8; 32]>,
    /// Declared family members
    #[serde(default)]
    pub family: Vec<RelayId>,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

impl Relay {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Usable in the guard position
    pub fn is_guard_candidate(&self) -> bool {
        self.flags.guard
            && self.flags.running
            && self.flags.valid
            && self.flags.stable
            && self.flags.fast
            && self.ntor_onion_key.is_some()
    }

    /// Usable in the exit position for `port`
    pub fn is_exit_candidate(&self, port: u16) -> bool {
        self.flags.exit
            && !self.flags.bad_exit
            && self.flags.running
            && self.flags.valid
            && self.ntor_onion_key.is_some()
            && self.exit_policy.allows_port(port)
    }

    /// Usable in the middle position
    pub fn is_middle_candidate(&self) -> bool {
        self.flags.running && self.flags.valid && self.flags.fast && self.ntor_onion_key.is_some()
    }

    /// Usable as a rendezvous point
    pub fn is_rendezvous_candidate(&self) -> bool {
        self.flags.running && self.flags.fast && self.ntor_onion_key.is_some()
    }

    /// Both relays declare each other as family
    pub fn shares_family_with(&self, other: &Relay) -> bool {
        self.family.contains(&other.identity) && other.family.contains(&self.identity)
    }

    /// Same /16 IPv4 network
    pub fn shares_subnet_with(&self, other: &Relay) -> bool {
        match (self.address, other.address) {
            (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..2] == b.octets()[..2],
            _ => false,
        }
    }
}

/// Position-specific bandwidth weights from the consensus (units of 1/10000)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthWeights {
    pub wgg: u64,
    pub wgd: u64,
    pub wmg: u64,
    pub wmm: u64,
    pub wme: u64,
    pub wmd: u64,
    pub wee: u64,
    pub wed: u64,
}

impl Default for BandwidthWeights {
    fn default() -> Self {
        Self {
            wgg: 10000,
            wgd: 10000,
            wmg: 10000,
            wmm: 10000,
            wme: 10000,
            wmd: 10000,
            wee: 10000,
            wed: 10000,
        }
    }
}

/// Path position a relay is being weighted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Guard,
    Middle,
    Exit,
}

impl BandwidthWeights {
    /// Weighted bandwidth of `relay` in `position`
    pub fn weighted(&self, relay: &Relay, position: Position) -> u64 {
        let guard = relay.flags.guard;
        let exit = relay.flags.exit && !relay.flags.bad_exit;
        let weight = match position {
            Position::Guard => {
                if exit {
                    self.wgd
                } else {
                    self.wgg
                }
            }
            Position::Middle => match (guard, exit) {
                (true, true) => self.wmd,
                (true, false) => self.wmg,
                (false, true) => self.wme,
                (false, false) => self.wmm,
            },
            Position::Exit => {
                if guard {
                    self.wed
                } else {
                    self.wee
                }
            }
        };
        relay.bandwidth.saturating_mul(weight) / 10000
    }
}

/// An immutable snapshot of the currently valid relays
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusView {
    pub relays: Vec<Relay>,
    #[serde(default)]
    pub weights: BandwidthWeights,
}

impl ConsensusView {
    pub fn relay_by_id(&self, id: &RelayId) -> Option<&Relay> {
        self.relays.iter().find(|r| &r.identity == id)
    }
}

/// Source of consensus snapshots (the directory collaborator's contract)
pub trait DirectoryProvider: Send + Sync {
    /// Current read-only snapshot; refreshed out-of-band by the provider
    fn current_view(&self) -> Arc<ConsensusView>;
}

/// Directory provider over a read-copy-updated snapshot.
///
/// Readers take a cheap shared reference; `publish` swaps in a new
/// snapshot without blocking them.
pub struct SnapshotDirectory {
    view: RwLock<Arc<ConsensusView>>,
}

impl SnapshotDirectory {
    pub fn new(view: ConsensusView) -> Self {
        Self {
            view: RwLock::new(Arc::new(view)),
        }
    }

    pub fn publish(&self, view: ConsensusView) {
        *self.view.write().expect("directory lock poisoned") = Arc::new(view);
    }
}

impl DirectoryProvider for SnapshotDirectory {
    fn current_view(&self) -> Arc<ConsensusView> {
        Arc::clone(&self.view.read().expect("directory lock poisoned"))
    }
}

/// A selected three-hop path
#[derive(Debug, Clone)]
pub struct TorPath {
    pub guard: Relay,
    pub middle: Relay,
    pub exit: Relay,
}

/// Path selection over a consensus snapshot
pub struct PathSelector {
    view: Arc<ConsensusView>,
}

impl PathSelector {
    pub fn new(view: Arc<ConsensusView>) -> Self {
        Self { view }
    }

    pub fn view(&self) -> &ConsensusView {
        &self.view
    }

    /// All relays eligible for the guard position, excluding `exclude`
    pub fn guard_candidates(&self, exclude: &[RelayId]) -> Vec<&Relay> {
        self.view
            .relays
            .iter()
            .filter(|r| r.is_guard_candidate() && !exclude.contains(&r.identity))
            .collect()
    }

    /// Bandwidth-weighted pick of a guard
    pub fn pick_guard(&self, exclude: &[RelayId]) -> Result<Relay> {
        let candidates = self.guard_candidates(exclude);
        self.weighted_pick(&candidates, Position::Guard)
            .ok_or_else(|| TorError::InsufficientRelays("no guard candidates".into()))
    }

    /// Bandwidth-weighted pick of an exit allowing `port`
    pub fn pick_exit(&self, port: u16, exclude: &[&Relay]) -> Result<Relay> {
        let any_exit = self
            .view
            .relays
            .iter()
            .any(|r| r.flags.exit && !r.flags.bad_exit && r.flags.running && r.flags.valid);
        let candidates: Vec<&Relay> = self
            .view
            .relays
            .iter()
            .filter(|r| r.is_exit_candidate(port) && Self::diverse_from(r, exclude))
            .collect();
        if candidates.is_empty() {
            return if any_exit {
                Err(TorError::NoExitForPort(port))
            } else {
                Err(TorError::InsufficientRelays("no exit relays".into()))
            };
        }
        self.weighted_pick(&candidates, Position::Exit)
            .ok_or_else(|| TorError::NoExitForPort(port))
    }

    /// Bandwidth-weighted pick of a middle relay
    pub fn pick_middle(&self, exclude: &[&Relay]) -> Result<Relay> {
        let candidates: Vec<&Relay> = self
            .view
            .relays
            .iter()
            .filter(|r| r.is_middle_candidate() && Self::diverse_from(r, exclude))
            .collect();
        self.weighted_pick(&candidates, Position::Middle)
            .ok_or_else(|| TorError::InsufficientRelays("no middle candidates".into()))
    }

    /// Random rendezvous point (any Running + Fast relay)
    pub fn pick_rendezvous(&self, exclude: &[&Relay]) -> Result<Relay> {
        let candidates: Vec<&Relay> = self
            .view
            .relays
            .iter()
            .filter(|r| r.is_rendezvous_candidate() && Self::diverse_from(r, exclude))
            .collect();
        self.weighted_pick(&candidates, Position::Middle)
            .ok_or_else(|| TorError::InsufficientRelays("no rendezvous candidates".into()))
    }

    /// Relays carrying the HSDir flag
    pub fn hsdir_candidates(&self) -> Vec<&Relay> {
        self.view
            .relays
            .iter()
            .filter(|r| r.flags.hs_dir && r.flags.running && r.flags.valid)
            .collect()
    }

    /// Complete a path for `port` given a guard from the guard store.
    ///
    /// Exit first (the scarcer position), then a middle diverse from both.
    pub fn select_path(&self, guard: Relay, port: u16) -> Result<TorPath> {
        let exit = self.pick_exit(port, &[&guard])?;
        let middle = self.pick_middle(&[&guard, &exit])?;
        Ok(TorPath {
            guard,
            middle,
            exit,
        })
    }

    /// Directory-style path (guard + middle + chosen relay as last hop)
    pub fn select_path_to(&self, guard: Relay, last: Relay) -> Result<TorPath> {
        let middle = self.pick_middle(&[&guard, &last])?;
        Ok(TorPath {
            guard,
            middle,
            exit: last,
        })
    }

    fn diverse_from(candidate: &Relay, chosen: &[&Relay]) -> bool {
        chosen.iter().all(|other| {
            candidate.identity != other.identity
                && !candidate.shares_subnet_with(other)
                && !candidate.shares_family_with(other)
        })
    }

    fn weighted_pick(&self, candidates: &[&Relay], position: Position) -> Option<Relay> {
        if candidates.is_empty() {
            return None;
        }
        let weights: Vec<u64> = candidates
            .iter()
            .map(|r| self.view.weights.weighted(r, position).max(1))
            .collect();
        let dist = WeightedIndex::new(&weights).ok()?;
        let mut rng = rand::thread_rng();
        Some(candidates[dist.sample(&mut rng)].clone())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_relay;
    use super::*;

    fn test_view(relays: Vec<Relay>) -> Arc<ConsensusView> {
        Arc::new(ConsensusView {
            relays,
            weights: BandwidthWeights::default(),
        })
    }

    #[test]
    fn test_exit_policy_summary() {
        let policy = ExitPolicy::from_summary("accept 80,443,8000-8999").unwrap();
        assert!(policy.allows_port(80));
        assert!(policy.allows_port(443));
        assert!(policy.allows_port(8500));
        assert!(!policy.allows_port(25));

        let policy = ExitPolicy::from_summary("reject 25,119").unwrap();
        assert!(policy.allows_port(80));
        assert!(!policy.allows_port(25));

        // Default rejects everything
        let policy = ExitPolicy::default();
        assert!(!policy.allows_port(80));
    }

    #[test]
    fn test_flag_parsing() {
        let flags = RelayFlags::from_line("Exit Fast Guard HSDir Running Stable V2Dir Valid");
        assert!(flags.exit && flags.fast && flags.guard && flags.hs_dir);
        assert!(flags.running && flags.stable && flags.valid);
        assert!(!flags.authority && !flags.bad_exit);
    }

    #[test]
    fn test_path_selection_is_diverse() {
        let mut relays = Vec::new();
        for i in 1..=10u8 {
            relays.push(test_relay(&format!("relay{}", i), i, [10, i, 0, 1]));
        }
        let selector = PathSelector::new(test_view(relays));

        for _ in 0..20 {
            let guard = selector.pick_guard(&[]).unwrap();
            let path = selector.select_path(guard, 443).unwrap();
            assert_ne!(path.guard.identity, path.middle.identity);
            assert_ne!(path.guard.identity, path.exit.identity);
            assert_ne!(path.middle.identity, path.exit.identity);
            assert!(!path.guard.shares_subnet_with(&path.middle));
            assert!(!path.middle.shares_subnet_with(&path.exit));
        }
    }

    #[test]
    fn test_same_subnet_excluded() {
        // Two relays in 10.1.0.0/16 plus one in 10.2.0.0/16: the pair can
        // never appear together
        let relays = vec![
            test_relay("a", 1, [10, 1, 0, 1]),
            test_relay("b", 2, [10, 1, 5, 1]),
            test_relay("c", 3, [10, 2, 0, 1]),
        ];
        let selector = PathSelector::new(test_view(relays));

        for _ in 0..20 {
            let guard = selector.pick_guard(&[]).unwrap();
            if let Ok(path) = selector.select_path(guard, 80) {
                assert!(!path.guard.shares_subnet_with(&path.middle));
                assert!(!path.guard.shares_subnet_with(&path.exit));
                assert!(!path.middle.shares_subnet_with(&path.exit));
            }
        }
    }

    #[test]
    fn test_family_excluded() {
        let mut a = test_relay("a", 1, [10, 1, 0, 1]);
        let mut b = test_relay("b", 2, [10, 2, 0, 1]);
        let c = test_relay("c", 3, [10, 3, 0, 1]);
        a.family = vec![b.identity];
        b.family = vec![a.identity];

        assert!(a.shares_family_with(&b));
        assert!(!a.shares_family_with(&c));

        let selector = PathSelector::new(test_view(vec![a.clone(), b, c]));
        for _ in 0..20 {
            if let Ok(path) = selector.select_path(a.clone(), 80) {
                assert_ne!(path.middle.nickname, "b");
                assert_ne!(path.exit.nickname, "b");
            }
        }
    }

    #[test]
    fn test_no_exit_for_port() {
        let mut relay = test_relay("a", 1, [10, 1, 0, 1]);
        relay.exit_policy = ExitPolicy::from_summary("accept 443").unwrap();
        let other = test_relay("b", 2, [10, 2, 0, 1]);
        let mut no_exit = other.clone();
        no_exit.exit_policy = ExitPolicy::from_summary("accept 443").unwrap();

        let selector = PathSelector::new(test_view(vec![relay, no_exit]));
        let result = selector.pick_exit(25, &[]);
        assert!(matches!(result, Err(TorError::NoExitForPort(25))));
    }

    #[test]
    fn test_insufficient_relays() {
        let selector = PathSelector::new(test_view(Vec::new()));
        assert!(matches!(
            selector.pick_guard(&[]),
            Err(TorError::InsufficientRelays(_))
        ));
    }

    #[test]
    fn test_bandwidth_weighting_prefers_heavy_relays() {
        let mut light = test_relay("light", 1, [10, 1, 0, 1]);
        light.bandwidth = 1;
        let mut heavy = test_relay("heavy", 2, [10, 2, 0, 1]);
        heavy.bandwidth = 1_000_000;

        let selector = PathSelector::new(test_view(vec![light, heavy]));
        let mut heavy_picks = 0;
        for _ in 0..50 {
            if selector.pick_guard(&[]).unwrap().nickname == "heavy" {
                heavy_picks += 1;
            }
        }
        assert!(heavy_picks > 40, "heavy relay picked {}/50", heavy_picks);
    }

    #[test]
    fn test_snapshot_directory_publishes() {
        let directory = SnapshotDirectory::new(ConsensusView::default());
        assert!(directory.current_view().relays.is_empty());

        directory.publish(ConsensusView {
            relays: vec![test_relay("a", 1, [10, 1, 0, 1])],
            weights: BandwidthWeights::default(),
        });
        assert_eq!(directory.current_view().relays.len(), 1);
    }
}
