// whirlpool-coordinator-rs
// Copyright (C) 2022  Straylight <straylight_orbit@protonmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Ban ledger. Misbehaving inputs are blamed under an identifier that either pins the exact
//! UTXO or, for timeouts, the whole Tx0 that funded it. Records are never deleted; lifting a
//! ban is itself an entry in the ledger.

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::OutPoint;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::input::RegisteredInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlameReason {
    ConfirmationTimeout,
    MissingOutput,
    InvalidSignature,
    SigningTimeout,
    Operator,
}

impl fmt::Display for BlameReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlameReason::ConfirmationTimeout => "CONFIRMATION_TIMEOUT",
            BlameReason::MissingOutput => "MISSING_OUTPUT",
            BlameReason::InvalidSignature => "INVALID_SIGNATURE",
            BlameReason::SigningTimeout => "SIGNING_TIMEOUT",
            BlameReason::Operator => "OPERATOR",
        })
    }
}

/// What a blame pins down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlameScope {
    /// Exactly the misbehaving UTXO.
    Utxo,
    /// Everything [`compute_blame_identifier`] groups with it.
    Rule,
}

/// Blame identifier of an input: the funding transaction for a mustMix input, the UTXO itself
/// for a remixing one.
pub fn compute_blame_identifier(outpoint: &OutPoint, liquidity: bool) -> String {
    if liquidity {
        outpoint.to_string()
    } else {
        outpoint.txid.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlameRecord {
    pub identifier: String,
    pub reason: BlameReason,
    pub mix_id: Option<String>,
    pub was_over_tor: bool,
    /// Unix seconds.
    pub created_at: u64,
}

impl BlameRecord {
    pub fn new(
        identifier: String,
        reason: BlameReason,
        mix_id: Option<String>,
        was_over_tor: bool,
    ) -> Self {
        Self {
            identifier,
            reason,
            mix_id,
            was_over_tor,
            created_at: unix_now(),
        }
    }

    pub fn for_input(
        input: &RegisteredInput,
        scope: BlameScope,
        reason: BlameReason,
        mix_id: &str,
    ) -> Self {
        let identifier = match scope {
            BlameScope::Utxo => input.outpoint().to_string(),
            BlameScope::Rule => compute_blame_identifier(input.outpoint(), input.liquidity),
        };

        Self::new(identifier, reason, Some(mix_id.to_owned()), input.over_tor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LedgerEntry {
    Blame(BlameRecord),
    #[serde(rename_all = "camelCase")]
    Lift { identifier: String, lifted_at: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt entry at line {line}: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },
}

/// Durable home of the ledger.
pub trait BlameStore: Send + Sync {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError>;
    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError>;
}

impl<S: BlameStore + ?Sized> BlameStore for Arc<S> {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        (**self).append(entry)
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).load()
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlameStore(Mutex<Vec<LedgerEntry>>);

impl MemoryBlameStore {
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.0.lock().clone()
    }
}

impl BlameStore for MemoryBlameStore {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.0.lock().push(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.entries())
    }
}

/// JSON lines, one entry per line, append only.
#[derive(Debug)]
pub struct FileBlameStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl FileBlameStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }
}

impl BlameStore for FileBlameStore {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;

        Ok(())
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let entry = serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
                line: i + 1,
                source,
            })?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    active: HashMap<String, BlameRecord>,
    history: Vec<LedgerEntry>,
}

impl LedgerState {
    fn apply(&mut self, entry: LedgerEntry) {
        match &entry {
            LedgerEntry::Blame(record) => {
                self.active
                    .entry(record.identifier.clone())
                    .or_insert_with(|| record.clone());
            }
            LedgerEntry::Lift { identifier, .. } => {
                self.active.remove(identifier);
            }
        }
        self.history.push(entry);
    }
}

/// In-memory view of the ban ledger backed by a [`BlameStore`].
///
/// Pool code records blames with [`BanLedger::record`] while holding its lock and hands the
/// returned entries to [`BanLedger::persist`] once the lock is released. Entries the store
/// refused stay pending, in order, until a later write gets through.
pub struct BanLedger {
    store: Box<dyn BlameStore>,
    state: RwLock<LedgerState>,
    pending: Mutex<Vec<LedgerEntry>>,
}

impl BanLedger {
    /// Replays the store.
    pub fn open(store: Box<dyn BlameStore>) -> Result<Self, StoreError> {
        let mut state = LedgerState::default();
        for entry in store.load()? {
            state.apply(entry);
        }

        info!(
            "ban ledger loaded: {} entries, {} active bans",
            state.history.len(),
            state.active.len()
        );

        Ok(Self {
            store,
            state: RwLock::new(state),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryBlameStore::default()),
            state: RwLock::new(LedgerState::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Returns the active ban matching either the blame identifier of `outpoint` or the UTXO
    /// itself.
    pub fn is_banned(&self, outpoint: &OutPoint, liquidity: bool) -> Option<BlameRecord> {
        let state = self.state.read();
        state
            .active
            .get(&compute_blame_identifier(outpoint, liquidity))
            .or_else(|| state.active.get(&outpoint.to_string()))
            .cloned()
    }

    pub fn is_identifier_banned(&self, identifier: &str) -> bool {
        self.state.read().active.contains_key(identifier)
    }

    /// Applies a blame to the in-memory view and returns the entry still to be persisted.
    pub fn record(&self, record: BlameRecord) -> LedgerEntry {
        warn!(
            "blame {} for {} (mix {})",
            record.reason,
            record.identifier,
            record.mix_id.as_deref().unwrap_or("-")
        );

        let entry = LedgerEntry::Blame(record);
        self.state.write().apply(entry.clone());
        entry
    }

    /// Writes earlier pending entries, then `entries`. On failure the unwritten ones are kept
    /// for the next call.
    pub fn persist(&self, entries: &[LedgerEntry]) -> Result<(), StoreError> {
        let mut pending = self.pending.lock();
        pending.extend_from_slice(entries);

        let mut written = 0;
        let result = pending.iter().try_for_each(|entry| -> Result<(), StoreError> {
            self.store.append(entry)?;
            written += 1;
            Ok(())
        });
        pending.drain(..written);

        if let Err(e) = &result {
            warn!("ban ledger: {} entries pending: {}", pending.len(), e);
        }
        result
    }

    /// Retries pending entries.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.persist(&[])
    }

    pub fn nb_pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Records and persists a ban outside of any mix.
    pub fn ban(&self, record: BlameRecord) -> Result<(), StoreError> {
        let entry = self.record(record);
        self.persist(&[entry])
    }

    /// Lifts an active ban. Returns `false` if nothing was banned under `identifier`.
    pub fn lift_ban(&self, identifier: &str) -> Result<bool, StoreError> {
        if !self.is_identifier_banned(identifier) {
            return Ok(false);
        }

        let entry = LedgerEntry::Lift {
            identifier: identifier.to_owned(),
            lifted_at: unix_now(),
        };
        self.state.write().apply(entry.clone());
        info!("ban lifted for {}", identifier);

        self.persist(&[entry])?;
        Ok(true)
    }

    pub fn active_bans(&self) -> Vec<BlameRecord> {
        let mut bans: Vec<_> = self.state.read().active.values().cloned().collect();
        bans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        bans
    }

    pub fn history(&self) -> Vec<LedgerEntry> {
        self.state.read().history.clone()
    }
}

impl fmt::Debug for BanLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BanLedger")
            .field("active", &self.state.read().active.len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
