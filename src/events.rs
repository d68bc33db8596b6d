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

use bitcoin::{OutPoint, Transaction, Txid};

use crate::mix::FailReason;
use crate::pool::PoolId;

/// Something participants or operators need to hear about. Delivered to listeners after the
/// pool lock has been released.
#[derive(Debug, Clone)]
pub enum MixEvent {
    MixStarted {
        pool_id: PoolId,
        mix_id: String,
    },
    /// Asks an admitted participant to confirm; carries the mix's DER public key.
    ConfirmInputInvite {
        pool_id: PoolId,
        mix_id: String,
        username: String,
        public_key: Vec<u8>,
    },
    InputConfirmed {
        pool_id: PoolId,
        mix_id: String,
        username: String,
        signed_bordereau: Vec<u8>,
    },
    RegisterOutputInvite {
        pool_id: PoolId,
        mix_id: String,
        inputs_hash: String,
        usernames: Vec<String>,
    },
    RevealOutputInvite {
        pool_id: PoolId,
        mix_id: String,
        usernames: Vec<String>,
    },
    SigningInvite {
        pool_id: PoolId,
        mix_id: String,
        transaction: Transaction,
        usernames: Vec<String>,
    },
    MixSuccess {
        pool_id: PoolId,
        mix_id: String,
        txid: Txid,
        usernames: Vec<String>,
    },
    MixFail {
        pool_id: PoolId,
        mix_id: String,
        reason: FailReason,
        usernames: Vec<String>,
        /// Participants whose inputs were not requeued.
        dropped: Vec<String>,
    },
    InputEvicted {
        pool_id: PoolId,
        username: String,
        outpoint: OutPoint,
        reason: EvictionReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// A directory registration was not refreshed in time.
    Stale,
    Disconnected,
    /// Banned while waiting in the queue.
    Banned,
}

impl MixEvent {
    pub fn pool_id(&self) -> &PoolId {
        match self {
            MixEvent::MixStarted { pool_id, .. }
            | MixEvent::ConfirmInputInvite { pool_id, .. }
            | MixEvent::InputConfirmed { pool_id, .. }
            | MixEvent::RegisterOutputInvite { pool_id, .. }
            | MixEvent::RevealOutputInvite { pool_id, .. }
            | MixEvent::SigningInvite { pool_id, .. }
            | MixEvent::MixSuccess { pool_id, .. }
            | MixEvent::MixFail { pool_id, .. }
            | MixEvent::InputEvicted { pool_id, .. } => pool_id,
        }
    }

    /// Participants the event is addressed to.
    pub fn recipients(&self) -> Vec<&str> {
        match self {
            MixEvent::MixStarted { .. } => Vec::new(),
            MixEvent::ConfirmInputInvite { username, .. }
            | MixEvent::InputConfirmed { username, .. }
            | MixEvent::InputEvicted { username, .. } => vec![username.as_str()],
            MixEvent::RegisterOutputInvite { usernames, .. }
            | MixEvent::RevealOutputInvite { usernames, .. }
            | MixEvent::SigningInvite { usernames, .. }
            | MixEvent::MixSuccess { usernames, .. }
            | MixEvent::MixFail { usernames, .. } => {
                usernames.iter().map(String::as_str).collect()
            }
        }
    }
}

pub type Listener = Box<dyn Fn(&MixEvent) + Send + Sync>;
