//! Point-in-time snapshots of the route table, snapshot diffing, and the
//! safe-mode fallback path.
//!
//! Snapshots serialize deterministically (ordered maps) so a
//! snapshot → restore → snapshot round trip is byte-equivalent modulo the
//! timestamp. The last-known-good file is written atomically via a sibling
//! temp file and rename.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use weft_types::{Route, SelectionConfig, WeftError};

use crate::dampening::DampeningInfo;
use crate::stats::inc;
use crate::table::{RouteTable, TableStats};

/// Serialized point-in-time record of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Every stored route, `prefix → peer → route`, ordered.
    pub routes: BTreeMap<String, BTreeMap<String, Route>>,
    /// Dampening states with a non-zero decayed penalty.
    pub dampening_states: BTreeMap<String, DampeningInfo>,
    /// Population statistics at snapshot time.
    pub stats: TableStats,
}

/// Peer-level change for one prefix between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedPrefix {
    /// The prefix whose peer set changed.
    pub prefix: String,
    /// Peers present only in the newer snapshot.
    pub added_peers: Vec<String>,
    /// Peers present only in the older snapshot.
    pub removed_peers: Vec<String>,
}

/// Penalty movement for one prefix between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyDelta {
    /// The prefix whose penalty changed.
    pub prefix: String,
    /// Penalty in the older snapshot.
    pub old_penalty: u32,
    /// Penalty in the newer snapshot.
    pub new_penalty: u32,
}

/// Difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// Prefixes only in the newer snapshot.
    pub added_prefixes: Vec<String>,
    /// Prefixes only in the older snapshot.
    pub removed_prefixes: Vec<String>,
    /// Prefixes whose peer sets differ.
    pub modified_prefixes: Vec<ModifiedPrefix>,
    /// Prefixes whose dampening penalty moved.
    pub dampening_changes: Vec<PenaltyDelta>,
}

impl RouteTable {
    /// Serialize the current table state.
    #[must_use]
    pub fn take_snapshot_at(&self, now: DateTime<Utc>) -> TableSnapshot {
        let routes = self
            .routes_map()
            .iter()
            .map(|(prefix, peers)| {
                let peers = peers
                    .iter()
                    .map(|(peer, route)| (peer.clone(), route.clone()))
                    .collect();
                (prefix.clone(), peers)
            })
            .collect();
        let dampening_states = self
            .dampening()
            .penalized_prefixes_at(now)
            .map(|(prefix, info)| (prefix.to_string(), info))
            .collect();
        inc(&self.counters().route_snapshots_taken_total);
        TableSnapshot {
            timestamp: now,
            routes,
            dampening_states,
            stats: self.stats(),
        }
    }

    /// [`Self::take_snapshot_at`] against the current wall clock.
    #[must_use]
    pub fn take_snapshot(&self) -> TableSnapshot {
        self.take_snapshot_at(Utc::now())
    }

    /// Clear current state and rebuild from a snapshot.
    ///
    /// # Errors
    /// Returns `WeftError::Validation` when any snapshot route fails
    /// validation; the table is left cleared in that case rather than
    /// partially restored.
    pub fn restore_from_snapshot_at(
        &mut self,
        snapshot: &TableSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), WeftError> {
        self.replace_routes(std::collections::HashMap::new());
        self.dampening_mut().clear_all();

        let mut routes = std::collections::HashMap::new();
        for (prefix, peers) in &snapshot.routes {
            let mut restored = std::collections::HashMap::new();
            for (peer, route) in peers {
                route.attributes.validate()?;
                restored.insert(peer.clone(), route.clone());
            }
            routes.insert(prefix.clone(), restored);
        }
        self.replace_routes(routes);

        for (prefix, info) in &snapshot.dampening_states {
            self.dampening_mut().restore_state(prefix, info, now);
        }
        Ok(())
    }

    /// [`Self::restore_from_snapshot_at`] against the current wall clock.
    ///
    /// # Errors
    /// See [`Self::restore_from_snapshot_at`].
    pub fn restore_from_snapshot(&mut self, snapshot: &TableSnapshot) -> Result<(), WeftError> {
        self.restore_from_snapshot_at(snapshot, Utc::now())
    }

    /// Compute what changed from `older` to `newer`.
    #[must_use]
    pub fn diff_snapshots(older: &TableSnapshot, newer: &TableSnapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();

        for prefix in newer.routes.keys() {
            if !older.routes.contains_key(prefix) {
                diff.added_prefixes.push(prefix.clone());
            }
        }
        for (prefix, old_peers) in &older.routes {
            match newer.routes.get(prefix) {
                None => diff.removed_prefixes.push(prefix.clone()),
                Some(new_peers) => {
                    let added: Vec<String> = new_peers
                        .keys()
                        .filter(|peer| !old_peers.contains_key(*peer))
                        .cloned()
                        .collect();
                    let removed: Vec<String> = old_peers
                        .keys()
                        .filter(|peer| !new_peers.contains_key(*peer))
                        .cloned()
                        .collect();
                    if !added.is_empty() || !removed.is_empty() {
                        diff.modified_prefixes.push(ModifiedPrefix {
                            prefix: prefix.clone(),
                            added_peers: added,
                            removed_peers: removed,
                        });
                    }
                }
            }
        }

        let prefixes: std::collections::BTreeSet<&String> = older
            .dampening_states
            .keys()
            .chain(newer.dampening_states.keys())
            .collect();
        for prefix in prefixes {
            let old_penalty = older
                .dampening_states
                .get(prefix)
                .map_or(0, |info| info.penalty);
            let new_penalty = newer
                .dampening_states
                .get(prefix)
                .map_or(0, |info| info.penalty);
            if old_penalty != new_penalty {
                diff.dampening_changes.push(PenaltyDelta {
                    prefix: prefix.clone(),
                    old_penalty,
                    new_penalty,
                });
            }
        }

        diff
    }

    /// Persist the current state as the last-known-good snapshot.
    ///
    /// The file is written to a sibling temp path and renamed into place so
    /// a crash mid-write never corrupts the fallback.
    ///
    /// # Errors
    /// Returns `WeftError::Snapshot` on serialization or filesystem failure.
    pub fn save_last_known_good_snapshot(&self) -> Result<(), WeftError> {
        if !self.safe_mode_config().enabled {
            return Ok(());
        }
        let path = self.safe_mode_config().snapshot_path.clone();
        let snapshot = self.take_snapshot();
        let payload = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| WeftError::snapshot(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WeftError::snapshot(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, payload).map_err(|e| WeftError::snapshot(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| WeftError::snapshot(e.to_string()))?;
        tracing::info!(path = %path.display(), "saved last-known-good snapshot");
        Ok(())
    }

    /// Enter safe mode by restoring the last-known-good snapshot.
    ///
    /// Returns `true` when the snapshot was loaded and the table is now
    /// serving from it; `false` when safe mode is disabled or the snapshot
    /// is missing/unreadable (the table is left as-is in the disabled case).
    pub fn enter_safe_mode(&mut self) -> bool {
        if !self.safe_mode_config().enabled {
            return false;
        }
        let path = self.safe_mode_config().snapshot_path.clone();
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<TableSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "safe mode snapshot unreadable");
                    return false;
                }
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "safe mode snapshot not found");
                return false;
            }
        };
        if let Err(err) = self.restore_from_snapshot(&snapshot) {
            tracing::warn!(%err, "safe mode snapshot failed validation");
            return false;
        }
        self.set_safe_mode_active();
        tracing::warn!(path = %path.display(), "entered safe mode from last-known-good snapshot");
        true
    }
}

/// Apply a policy loader with retries, falling back to safe mode.
///
/// The loader is attempted up to `max_retries` times with a jittered
/// `retry_delay_seconds` pause between attempts; the table lock is only
/// held to apply a successful result. On exhaustion the table enters safe
/// mode from the last-known-good snapshot.
///
/// # Errors
/// Returns the final loader error when every attempt failed, regardless of
/// whether the safe-mode fallback succeeded; callers inspect
/// [`RouteTable::is_in_safe_mode`] to learn which state they are in.
pub async fn load_policy_or_safe_mode<F>(
    table: &tokio::sync::RwLock<RouteTable>,
    mut load: F,
) -> Result<(), WeftError>
where
    F: FnMut() -> Result<SelectionConfig, WeftError>,
{
    let (max_retries, delay_s) = {
        let guard = table.read().await;
        let cfg = guard.safe_mode_config();
        (cfg.max_retries.max(1), cfg.retry_delay_seconds)
    };

    let mut last_err = WeftError::config("policy loader never ran");
    for attempt in 1..=max_retries {
        match load() {
            Ok(selection) => {
                return table.write().await.set_selection_config(selection);
            }
            Err(err) => {
                tracing::warn!(attempt, %err, "policy load failed");
                last_err = err;
                if attempt < max_retries {
                    let base_ms = u64::from(delay_s) * 1000;
                    let jitter = rand::rng().random_range(0..=base_ms / 4);
                    tokio::time::sleep(std::time::Duration::from_millis(base_ms + jitter)).await;
                }
            }
        }
    }

    table.write().await.enter_safe_mode();
    Err(last_err)
}
