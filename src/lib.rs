//! # tor-core
//!
//! Client-side Tor protocol engine: cell framing and onion cryptography,
//! the circuit state machine, stream multiplexing with isolation, path
//! selection with persistent entry guards, and the v3 hidden-service
//! client rendezvous protocol.
//!
//! ## Architecture
//!
//! ```text
//! TorClient
//!   ├── CircuitPool (isolation-keyed rings)
//!   │     └── CircuitBuilder ── Link (one TLS connection per relay)
//!   ├── StreamMultiplexer (BEGIN/DATA/END, RESOLVE)
//!   ├── GuardStore (persistent entry guards)
//!   ├── PathSelector (over the directory collaborator's snapshot)
//!   └── HsClient (v3 onion addresses)
//! ```
//!
//! The SOCKS front-end, the directory client that fetches and parses
//! consensus documents, and the control/metrics surfaces are external
//! collaborators: the engine consumes a parsed relay view through
//! [`path::DirectoryProvider`] and exposes the stream interface below.

pub mod circuit;
pub mod circuit_pool;
pub mod config;
pub mod error;
pub mod guards;
pub mod hs;
pub mod isolation;
pub mod link;
pub mod path;
pub mod protocol;
pub mod stream_mux;

pub use circuit::{Circuit, CircuitBuilder, CircuitProvider, CircuitState};
pub use circuit_pool::{CircuitPool, PoolStats};
pub use config::{IsolationMode, TorConfig};
pub use error::{EndReason, Result, TorError};
pub use guards::{GuardEntry, GuardStore};
pub use hs::{HsClient, OnionAddress};
pub use isolation::IsolationKey;
pub use link::Link;
pub use path::{ConsensusView, DirectoryProvider, PathSelector, Relay, RelayId, SnapshotDirectory};
pub use stream_mux::{ResolvedAddr, StreamMultiplexer, TorStream};

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// The assembled protocol engine.
///
/// This is the production composition root: it wires the pool, builder,
/// guard store, multiplexer, and hidden-service client together and
/// exposes the operations the SOCKS collaborator consumes.
pub struct TorClient {
    config: Arc<TorConfig>,
    directory: Arc<dyn DirectoryProvider>,
    guards: Arc<GuardStore>,
    pool: Arc<CircuitPool>,
    mux: Arc<StreamMultiplexer>,
    hs: HsClient,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl TorClient {
    /// Assemble the engine over a directory provider.
    ///
    /// Loads the guard store from the configured data directory and
    /// starts the pool's background builder.
    pub fn new(config: TorConfig, directory: Arc<dyn DirectoryProvider>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let guards = Arc::new(GuardStore::load(
            &config.data_dir,
            config.num_entry_guards,
        )?);
        let builder: Arc<dyn CircuitProvider> =
            Arc::new(CircuitBuilder::new(Arc::clone(&config)));
        let mux = Arc::new(StreamMultiplexer::new(Arc::clone(&config)));

        let pool = Arc::new(CircuitPool::new(
            Arc::clone(&config),
            Arc::clone(&builder),
            Arc::clone(&directory),
            Arc::clone(&guards),
        ));
        let maintenance = pool.start_maintenance();

        let hsdir_client = Arc::new(hs::CircuitHsDirClient::new(
            Arc::clone(&builder),
            Arc::clone(&directory),
            Arc::clone(&guards),
            Arc::clone(&mux),
        ));
        let hs = HsClient::new(
            Arc::clone(&config),
            builder,
            Arc::clone(&directory),
            Arc::clone(&guards),
            hsdir_client,
        );

        log::info!("protocol engine assembled");

        Ok(Self {
            config,
            directory,
            guards,
            pool,
            mux,
            hs,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    /// Open a stream to `host:port` through an isolated circuit.
    ///
    /// `.onion` hosts go through the hidden-service client; everything
    /// else gets a circuit from the pool under `isolation` (or the key
    /// the configured default mode derives).
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        isolation: Option<IsolationKey>,
    ) -> Result<TorStream> {
        if OnionAddress::is_onion_host(host) {
            let address = OnionAddress::parse(host)?;
            let circuit = self.hs.connect(&address).await?;
            return self
                .mux
                .open_stream(
                    &circuit,
                    host,
                    port,
                    isolation.unwrap_or(IsolationKey::None),
                )
                .await;
        }

        let key = isolation
            .unwrap_or_else(|| IsolationKey::for_mode(self.config.isolation_mode, host, port));
        let circuit = self.pool.get(&key, port).await?;

        let stream = self.mux.open_stream(&circuit, host, port, key.clone()).await;
        match stream {
            Ok(stream) => {
                // The circuit keeps serving its isolation group
                self.pool.checkin(key, Arc::clone(&circuit)).await;
                Ok(stream)
            }
            Err(e @ TorError::StreamEnd(_)) => {
                // The exit refused the stream; the circuit itself is fine
                self.pool.checkin(key, circuit).await;
                Err(e)
            }
            Err(e) => {
                self.pool.discard(&key, &circuit);
                circuit.close().await;
                Err(e)
            }
        }
    }

    /// Resolve a hostname through the network
    pub async fn resolve(
        &self,
        host: &str,
        isolation: Option<IsolationKey>,
    ) -> Result<Vec<ResolvedAddr>> {
        let key = isolation
            .unwrap_or_else(|| IsolationKey::for_mode(self.config.isolation_mode, host, 0));
        let circuit = self.pool.get(&key, 443).await?;
        let result = self.mux.resolve(&circuit, host).await;
        self.pool.checkin(key, circuit).await;
        result
    }

    /// Reverse-resolve an address through the network
    pub async fn resolve_ptr(
        &self,
        addr: IpAddr,
        isolation: Option<IsolationKey>,
    ) -> Result<(String, u32)> {
        let key = isolation.unwrap_or(IsolationKey::None);
        let circuit = self.pool.get(&key, 443).await?;
        let result = self.mux.resolve_ptr(&circuit, addr).await;
        self.pool.checkin(key, circuit).await;
        result
    }

    /// Stop background work and close pooled circuits, bounded by
    /// `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        if let Some(handle) = self
            .maintenance
            .lock()
            .expect("maintenance lock poisoned")
            .take()
        {
            handle.abort();
        }
        if tokio::time::timeout(deadline, self.pool.drain())
            .await
            .is_err()
        {
            log::warn!("shutdown deadline elapsed with circuits still open");
        }
        let _ = self.guards.persist();
    }

    /// Engine state snapshot
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            relays_in_view: self.directory.current_view().relays.len(),
            guards: self.guards.entries().len(),
            pool: self.pool.stats(),
            streams: self.mux.stats(),
        }
    }
}

/// Snapshot returned by [`TorClient::status`]
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub relays_in_view: usize,
    pub guards: usize,
    pub pool: PoolStats,
    pub streams: stream_mux::StreamMuxStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::test_support::test_relay;

    fn engine() -> (TorClient, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = TorConfig::default();
        config.data_dir = dir.path().join("state");

        let directory = Arc::new(SnapshotDirectory::new(ConsensusView {
            relays: vec![test_relay("relay", 1, [10, 1, 0, 1])],
            weights: Default::default(),
        }));
        let client = TorClient::new(config, directory).unwrap();
        (client, dir)
    }

    #[tokio::test]
    async fn test_engine_assembles_and_shuts_down() {
        let (client, _dir) = engine();
        let status = client.status();
        assert_eq!(status.relays_in_view, 1);
        assert_eq!(status.guards, 0);

        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = TorConfig::default();
        config.circuit_pool_min = 100;
        let directory = Arc::new(SnapshotDirectory::new(ConsensusView::default()));
        assert!(matches!(
            TorClient::new(config, directory),
            Err(TorError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_onion_address_surfaces_early() {
        let (client, _dir) = engine();
        let result = client
            .connect("invalidinvalidinvalid.onion", 80, None)
            .await;
        assert!(matches!(result, Err(TorError::InvalidOnionAddress(_))));
        client.shutdown(Duration::from_millis(100)).await;
    }
}
