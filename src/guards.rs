//! Entry guard store
//!
//! A durable set of entry relays. Using the same small set of guards for
//! a long time bounds an adversary's opportunity to observe traffic entry;
//! rotating often would hand every new circuit a fresh chance to land on a
//! hostile relay.
//!
//! The store keeps up to `num_entry_guards` primary guards plus recently
//! unused history, confirms a guard after its first completed circuit,
//! retires repeatedly failing guards temporarily, evicts guards unused for
//! 90 days, and persists the set atomically to `guards.json` in the data
//! directory on every change.

use crate::error::{Result, TorError};
use crate::path::{PathSelector, Relay, RelayId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Guards unused this long are evicted
pub const GUARD_EXPIRY_SECS: u64 = 90 * 24 * 60 * 60;

/// Consecutive failures before a guard is temporarily retired
const MAX_FAILURES_BEFORE_RETIRE: u32 = 3;

/// How long a retired guard is skipped
const RETIREMENT_SECS: u64 = 60 * 60;

/// Name of the store file inside the data directory
const GUARDS_FILE: &str = "guards.json";

/// One persistent guard record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardEntry {
    pub fingerprint: RelayId,
    pub nickname: String,
    pub address: SocketAddr,
    /// Unix timestamp of first use
    pub first_used: u64,
    /// Unix timestamp of most recent use
    pub last_used: u64,
    /// Set after the first circuit completes through this guard
    pub confirmed: bool,
}

/// On-disk layout of the store
#[derive(Debug, Serialize, Deserialize)]
struct GuardFile {
    guards: Vec<GuardEntry>,
    last_updated: u64,
}

/// In-memory failure accounting (not persisted)
#[derive(Debug, Default, Clone)]
struct FailureInfo {
    consecutive_failures: u32,
    retired_until: u64,
}

struct GuardSet {
    /// Entries in preference order; the first `num_primary` are primary
    entries: Vec<GuardEntry>,
    failures: HashMap<RelayId, FailureInfo>,
}

/// Durable entry-guard set
pub struct GuardStore {
    path: PathBuf,
    num_primary: usize,
    state: Mutex<GuardSet>,
}

impl GuardStore {
    /// Load the store from `data_dir`, creating the directory (owner-only)
    /// if needed.
    pub fn load(data_dir: &Path, num_primary: usize) -> Result<Self> {
        create_private_dir(data_dir)?;
        let path = data_dir.join(GUARDS_FILE);

        let entries = match std::fs::read_to_string(&path) {
            Ok(json) => {
                let file: GuardFile = serde_json::from_str(&json)
                    .map_err(|e| TorError::Storage(format!("corrupt guard store: {}", e)))?;
                log::info!("loaded {} guards from {}", file.guards.len(), path.display());
                file.guards
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no saved guards, starting fresh");
                Vec::new()
            }
            Err(e) => return Err(TorError::Storage(format!("read guard store: {}", e))),
        };

        let store = Self {
            path,
            num_primary,
            state: Mutex::new(GuardSet {
                entries,
                failures: HashMap::new(),
            }),
        };
        store.evict_expired()?;
        Ok(store)
    }

    /// Pick a guard for a new circuit.
    ///
    /// Primary guards are tried in order; when none of them is currently
    /// usable (missing from the consensus or retired after failures), the
    /// next unused candidate is taken from the selector without demoting
    /// the primaries. `AllGuardsFailed` when nothing is usable at all.
    pub fn pick(&self, selector: &PathSelector) -> Result<Relay> {
        let now = now_secs();
        let mut changed = false;

        let picked = {
            let mut state = self.state.lock().expect("guard lock poisoned");

            let mut choice: Option<Relay> = None;
            for entry in state.entries.iter() {
                if let Some(info) = state.failures.get(&entry.fingerprint) {
                    if info.retired_until > now {
                        continue;
                    }
                }
                if let Some(relay) = selector.view().relay_by_id(&entry.fingerprint) {
                    if relay.is_guard_candidate() {
                        choice = Some(relay.clone());
                        break;
                    }
                }
            }

            match choice {
                Some(relay) => {
                    // Touch last_used on the matching entry
                    if let Some(entry) = state
                        .entries
                        .iter_mut()
                        .find(|e| e.fingerprint == relay.identity)
                    {
                        entry.last_used = now;
                        changed = true;
                    }
                    relay
                }
                None => {
                    // Extend the set with a fresh candidate
                    let exclude: Vec<RelayId> =
                        state.entries.iter().map(|e| e.fingerprint).collect();
                    let relay = selector
                        .pick_guard(&exclude)
                        .map_err(|_| TorError::AllGuardsFailed)?;
                    state.entries.push(GuardEntry {
                        fingerprint: relay.identity,
                        nickname: relay.nickname.clone(),
                        address: relay.socket_addr(),
                        first_used: now,
                        last_used: now,
                        confirmed: false,
                    });
                    log::info!("added new guard candidate {}", relay.nickname);
                    changed = true;
                    relay
                }
            }
        };

        if changed {
            self.persist()?;
        }
        Ok(picked)
    }

    /// A circuit completed through this guard: confirm it and clear its
    /// failure record.
    pub fn record_success(&self, id: &RelayId) -> Result<()> {
        let now = now_secs();
        {
            let mut state = self.state.lock().expect("guard lock poisoned");
            state.failures.remove(id);
            if let Some(entry) = state.entries.iter_mut().find(|e| &e.fingerprint == id) {
                if !entry.confirmed {
                    log::info!("guard {} confirmed", entry.nickname);
                }
                entry.confirmed = true;
                entry.last_used = now;
            }
        }
        self.persist()
    }

    /// A circuit through this guard failed; repeated failures retire it
    /// for a while.
    pub fn record_failure(&self, id: &RelayId) {
        let mut state = self.state.lock().expect("guard lock poisoned");
        let info = state.failures.entry(*id).or_default();
        info.consecutive_failures += 1;
        if info.consecutive_failures >= MAX_FAILURES_BEFORE_RETIRE {
            info.retired_until = now_secs() + RETIREMENT_SECS;
            log::warn!(
                "guard {:?} retired after {} consecutive failures",
                id,
                info.consecutive_failures
            );
        }
    }

    /// Drop guards unused for the expiry period
    pub fn evict_expired(&self) -> Result<()> {
        let cutoff = now_secs().saturating_sub(GUARD_EXPIRY_SECS);
        let evicted = {
            let mut state = self.state.lock().expect("guard lock poisoned");
            let before = state.entries.len();
            state.entries.retain(|e| e.last_used >= cutoff);
            before - state.entries.len()
        };
        if evicted > 0 {
            log::info!("evicted {} expired guards", evicted);
            self.persist()?;
        }
        Ok(())
    }

    /// Current primary guards (preference order)
    pub fn primaries(&self) -> Vec<GuardEntry> {
        let state = self.state.lock().expect("guard lock poisoned");
        state
            .entries
            .iter()
            .take(self.num_primary)
            .cloned()
            .collect()
    }

    /// All entries, primaries first
    pub fn entries(&self) -> Vec<GuardEntry> {
        self.state
            .lock()
            .expect("guard lock poisoned")
            .entries
            .clone()
    }

    /// Write the store atomically: temp file in the same directory, then
    /// rename over the target.
    pub fn persist(&self) -> Result<()> {
        let file = {
            let state = self.state.lock().expect("guard lock poisoned");
            GuardFile {
                guards: state.entries.clone(),
                last_updated: now_secs(),
            }
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| TorError::Storage(format!("serialize guards: {}", e)))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json.as_bytes())
            .map_err(|e| TorError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        set_private_file(&tmp)?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| TorError::Storage(format!("rename guard store: {}", e)))?;

        log::debug!("persisted {} guards", file.guards.len());
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| TorError::Storage(format!("create {}: {}", dir.display(), e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| TorError::Storage(format!("chmod {}: {}", dir.display(), e)))?;
    }
    Ok(())
}

fn set_private_file(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| TorError::Storage(format!("chmod {}: {}", path.display(), e)))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::test_support::test_relay;
    use crate::path::{BandwidthWeights, ConsensusView};
    use std::sync::Arc;

    fn selector_with(relays: Vec<Relay>) -> PathSelector {
        PathSelector::new(Arc::new(ConsensusView {
            relays,
            weights: BandwidthWeights::default(),
        }))
    }

    #[test]
    fn test_pick_adds_and_persists_guard() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = GuardStore::load(dir.path(), 3).unwrap();
        let selector = selector_with(vec![test_relay("g1", 1, [10, 1, 0, 1])]);

        let picked = store.pick(&selector).unwrap();
        assert_eq!(picked.nickname, "g1");
        assert!(dir.path().join("guards.json").exists());

        // Reload: the entry survives with identical fields
        let reloaded = GuardStore::load(dir.path(), 3).unwrap();
        let entries = reloaded.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fingerprint, picked.identity);
        assert_eq!(entries[0].nickname, "g1");
        assert!(!entries[0].confirmed);
        assert!(entries[0].first_used > 0);
    }

    #[test]
    fn test_pick_prefers_existing_primary() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = GuardStore::load(dir.path(), 3).unwrap();
        let relays = vec![
            test_relay("g1", 1, [10, 1, 0, 1]),
            test_relay("g2", 2, [10, 2, 0, 1]),
        ];
        let selector = selector_with(relays);

        let first = store.pick(&selector).unwrap();
        // Same guard every time while it stays usable
        for _ in 0..10 {
            assert_eq!(store.pick(&selector).unwrap().identity, first.identity);
        }
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_confirmation_roundtrips() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = GuardStore::load(dir.path(), 3).unwrap();
        let selector = selector_with(vec![test_relay("g1", 1, [10, 1, 0, 1])]);

        let picked = store.pick(&selector).unwrap();
        store.record_success(&picked.identity).unwrap();

        let reloaded = GuardStore::load(dir.path(), 3).unwrap();
        assert!(reloaded.entries()[0].confirmed);
    }

    #[test]
    fn test_failures_retire_guard_and_fall_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = GuardStore::load(dir.path(), 3).unwrap();
        let selector = selector_with(vec![
            test_relay("g1", 1, [10, 1, 0, 1]),
            test_relay("g2", 2, [10, 2, 0, 1]),
        ]);

        let first = store.pick(&selector).unwrap();
        for _ in 0..MAX_FAILURES_BEFORE_RETIRE {
            store.record_failure(&first.identity);
        }

        // The retired primary is skipped; a new candidate is appended
        // without removing the primary
        let second = store.pick(&selector).unwrap();
        assert_ne!(second.identity, first.identity);
        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fingerprint, first.identity);

        // Success clears the failure record and restores preference
        store.record_success(&first.identity).unwrap();
        assert_eq!(store.pick(&selector).unwrap().identity, first.identity);
    }

    #[test]
    fn test_all_guards_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = GuardStore::load(dir.path(), 3).unwrap();
        let selector = selector_with(vec![test_relay("g1", 1, [10, 1, 0, 1])]);

        let only = store.pick(&selector).unwrap();
        for _ in 0..MAX_FAILURES_BEFORE_RETIRE {
            store.record_failure(&only.identity);
        }
        assert!(matches!(
            store.pick(&selector),
            Err(TorError::AllGuardsFailed)
        ));
    }

    #[test]
    fn test_eviction_after_disuse() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = GuardStore::load(dir.path(), 3).unwrap();
        let selector = selector_with(vec![test_relay("g1", 1, [10, 1, 0, 1])]);
        store.pick(&selector).unwrap();

        // Age the entry past the expiry window on disk
        {
            let mut state = store.state.lock().unwrap();
            state.entries[0].last_used = now_secs() - GUARD_EXPIRY_SECS - 1;
        }
        store.persist().unwrap();

        let reloaded = GuardStore::load(dir.path(), 3).unwrap();
        assert!(reloaded.entries().is_empty());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = GuardStore::load(dir.path(), 3).unwrap();
        let selector = selector_with(vec![test_relay("g1", 1, [10, 1, 0, 1])]);
        store.pick(&selector).unwrap();
        store.persist().unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.contains(&"guards.json".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".tmp")));

        // The file parses and is never empty after a write
        let content = std::fs::read_to_string(dir.path().join("guards.json")).unwrap();
        assert!(!content.is_empty());
        let parsed: GuardFile = serde_json::from_str(&content).unwrap();
        assert!(parsed.last_updated > 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let data_dir = dir.path().join("state");
        let store = GuardStore::load(&data_dir, 3).unwrap();
        let selector = selector_with(vec![test_relay("g1", 1, [10, 1, 0, 1])]);
        store.pick(&selector).unwrap();

        let dir_mode = std::fs::metadata(&data_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(data_dir.join("guards.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
