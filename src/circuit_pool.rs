//! Circuit pool with isolation
//!
//! Keeps a ring of ready circuits per isolation key so stream requests are
//! served without waiting for a build, while never handing circuits across
//! isolation boundaries. Rings are bounded, topped up by a background
//! task, and drained of dirty, aged, or dead circuits.

use crate::circuit::{Circuit, CircuitProvider, CircuitState};
use crate::config::TorConfig;
use crate::error::Result;
use crate::guards::GuardStore;
use crate::isolation::IsolationKey;
use crate::path::{DirectoryProvider, PathSelector};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Circuits older than this are closed outright during maintenance
const MAX_CIRCUIT_AGE: Duration = Duration::from_secs(30 * 60);

/// Port pre-built spare circuits are provisioned against; rings serve a
/// request for another port only if the spare's exit allows it
const PREBUILD_PORT: u16 = 443;

/// Pool usage counters
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub built: u64,
    pub retired: u64,
}

/// Isolation-keyed rings of pre-built circuits
pub struct CircuitPool {
    config: Arc<TorConfig>,
    provider: Arc<dyn CircuitProvider>,
    directory: Arc<dyn DirectoryProvider>,
    guards: Arc<GuardStore>,
    rings: Mutex<HashMap<IsolationKey, VecDeque<Arc<Circuit>>>>,
    stats: Mutex<PoolStats>,
}

impl CircuitPool {
    pub fn new(
        config: Arc<TorConfig>,
        provider: Arc<dyn CircuitProvider>,
        directory: Arc<dyn DirectoryProvider>,
        guards: Arc<GuardStore>,
    ) -> Self {
        Self {
            config,
            provider,
            directory,
            guards,
            rings: Mutex::new(HashMap::new()),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Get a circuit for `key` whose exit allows `port`: a healthy spare
    /// from the key's ring if one exists, otherwise a fresh build. The
    /// returned circuit is checked out of the ring; give it back with
    /// [`checkin`](Self::checkin) when the stream closes.
    pub async fn get(&self, key: &IsolationKey, port: u16) -> Result<Arc<Circuit>> {
        if let Some(circuit) = self.take_usable(key, port) {
            log::debug!("pool hit for {:?}", key);
            self.stats.lock().expect("stats lock poisoned").hits += 1;
            return Ok(circuit);
        }

        self.stats.lock().expect("stats lock poisoned").misses += 1;
        log::debug!("pool miss for {:?}, building", key);
        self.build(port).await
    }

    /// Return a checked-out circuit to its ring; retires it instead when
    /// it is no longer fit for new streams or the ring is full.
    pub async fn checkin(&self, key: IsolationKey, circuit: Arc<Circuit>) {
        let keep = circuit.is_usable_for_new_streams(self.config.max_circuit_dirtiness)
            && circuit.age() < MAX_CIRCUIT_AGE;

        if keep {
            let mut rings = self.rings.lock().expect("ring lock poisoned");
            let ring = rings.entry(key).or_default();
            if ring.len() < self.config.circuit_pool_max {
                ring.push_back(circuit);
                return;
            }
        }

        self.stats.lock().expect("stats lock poisoned").retired += 1;
        circuit.close().await;
    }

    /// Drop a circuit that died in use; the background task will top the
    /// ring back up.
    pub fn discard(&self, key: &IsolationKey, circuit: &Arc<Circuit>) {
        let mut rings = self.rings.lock().expect("ring lock poisoned");
        if let Some(ring) = rings.get_mut(key) {
            ring.retain(|c| c.id() != circuit.id());
        }
        self.stats.lock().expect("stats lock poisoned").retired += 1;
    }

    fn take_usable(&self, key: &IsolationKey, port: u16) -> Option<Arc<Circuit>> {
        let mut rings = self.rings.lock().expect("ring lock poisoned");
        let ring = rings.get_mut(key)?;
        while let Some(circuit) = ring.pop_front() {
            let exit_ok = circuit
                .last_relay()
                .map(|r| r.exit_policy.allows_port(port))
                .unwrap_or(false);
            if exit_ok && circuit.is_usable_for_new_streams(self.config.max_circuit_dirtiness) {
                return Some(circuit);
            }
            // Unusable spare: let it drop out of the ring
            self.stats.lock().expect("stats lock poisoned").retired += 1;
        }
        None
    }

    async fn build(&self, port: u16) -> Result<Arc<Circuit>> {
        let view = self.directory.current_view();
        let selector = PathSelector::new(view);
        let guard = self.guards.pick(&selector)?;
        let guard_id = guard.identity;

        match self.provider.provide_for_port(&selector, guard, port).await {
            Ok(circuit) => {
                let _ = self.guards.record_success(&guard_id);
                self.stats.lock().expect("stats lock poisoned").built += 1;
                Ok(circuit)
            }
            Err(e) => {
                self.guards.record_failure(&guard_id);
                Err(e)
            }
        }
    }

    /// Spawn the maintenance task: every `new_circuit_period` it expires
    /// stale spares and tops every known ring up to the configured
    /// minimum.
    pub fn start_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.new_circuit_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.run_maintenance().await;
            }
        })
    }

    async fn run_maintenance(&self) {
        // Phase 1: sweep dead and aged circuits out of every ring
        let (stale, deficits) = {
            let mut rings = self.rings.lock().expect("ring lock poisoned");
            let mut stale = Vec::new();
            for ring in rings.values_mut() {
                let mut keep = VecDeque::with_capacity(ring.len());
                while let Some(circuit) = ring.pop_front() {
                    let dead = circuit.state() != CircuitState::Open
                        || circuit.link().is_closed()
                        || circuit.age() >= MAX_CIRCUIT_AGE;
                    if dead {
                        stale.push(circuit);
                    } else {
                        keep.push_back(circuit);
                    }
                }
                *ring = keep;
            }
            // Ensure the default ring exists so it gets pre-warmed
            rings.entry(IsolationKey::None).or_default();

            let deficits: Vec<(IsolationKey, usize)> = rings
                .iter()
                .filter(|(_, ring)| ring.len() < self.config.circuit_pool_min)
                .map(|(key, ring)| (key.clone(), self.config.circuit_pool_min - ring.len()))
                .collect();
            (stale, deficits)
        };

        for circuit in stale {
            self.stats.lock().expect("stats lock poisoned").retired += 1;
            circuit.close().await;
        }

        // Phase 2: top rings up to the minimum
        for (key, deficit) in deficits {
            for _ in 0..deficit {
                match self.build(PREBUILD_PORT).await {
                    Ok(circuit) => {
                        let mut rings = self.rings.lock().expect("ring lock poisoned");
                        let ring = rings.entry(key.clone()).or_default();
                        if ring.len() < self.config.circuit_pool_max {
                            ring.push_back(circuit);
                        }
                    }
                    Err(e) => {
                        log::warn!("pool top-up build failed for {:?}: {}", key, e);
                        break;
                    }
                }
            }
        }
    }

    /// Close everything (shutdown path)
    pub async fn drain(&self) {
        let circuits: Vec<Arc<Circuit>> = {
            let mut rings = self.rings.lock().expect("ring lock poisoned");
            rings.drain().flat_map(|(_, ring)| ring).collect()
        };
        futures::future::join_all(circuits.iter().map(|circuit| circuit.close())).await;
    }

    #[cfg(test)]
    fn ring_len(&self, key: &IsolationKey) -> usize {
        self.rings
            .lock()
            .expect("ring lock poisoned")
            .get(key)
            .map(|r| r.len())
            .unwrap_or(0)
    }
}
