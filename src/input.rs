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

use std::time::{Duration, Instant};

use bitcoin::{OutPoint, Script, TxOut, Txid};

use crate::pool::PoolId;

/// An unspent output as observed on chain. Never changes once observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoOutPoint {
    pub outpoint: OutPoint,
    pub value: u64,
    pub confirmations: u32,
    pub script_pubkey: Script,
}

impl UtxoOutPoint {
    pub fn new(outpoint: OutPoint, txout: &TxOut, confirmations: u32) -> Self {
        Self {
            outpoint,
            value: txout.value,
            confirmations,
            script_pubkey: txout.script_pubkey.clone(),
        }
    }

    pub fn tx_hash(&self) -> Txid {
        self.outpoint.txid
    }

    /// `txid:vout`
    pub fn id(&self) -> String {
        self.outpoint.to_string()
    }

    pub fn txout(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// Liveness bookkeeping for inputs registered through the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SorobanInputMeta {
    pub sender: String,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineReason {
    /// The user hash was already used by another input of the mix.
    UserHashReused,
    /// A remixing input is trying to mix with the identity that produced it.
    RemixWithSelf,
}

/// An input waiting in a queue or taking part in a mix.
#[derive(Debug, Clone)]
pub struct RegisteredInput {
    pub pool_id: PoolId,
    pub username: String,
    pub liquidity: bool,
    pub utxo: UtxoOutPoint,
    pub over_tor: bool,
    pub last_user_hash: Option<String>,
    pub enrolled_at: Instant,
    pub soroban: Option<SorobanInputMeta>,
    pub quarantine: Option<QuarantineReason>,
}

impl RegisteredInput {
    pub fn outpoint(&self) -> &OutPoint {
        &self.utxo.outpoint
    }

    pub fn is_soroban_origin(&self) -> bool {
        self.soroban.is_some()
    }

    /// Whether `other` comes from the same participant. Directory registrations are tied to
    /// their sender, the others to the connection's username.
    pub fn same_identity(&self, other: &RegisteredInput) -> bool {
        match (&self.soroban, &other.soroban) {
            (Some(ours), Some(theirs)) => ours.sender == theirs.sender,
            (None, None) => self.username == other.username,
            _ => false,
        }
    }

    pub fn refresh(&mut self, now: Instant) {
        if let Some(meta) = &mut self.soroban {
            meta.last_seen = now;
        }
    }

    /// Directory registrations go stale when not refreshed within `timeout`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match &self.soroban {
            Some(meta) => now.saturating_duration_since(meta.last_seen) > timeout,
            None => false,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }
}
