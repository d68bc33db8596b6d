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

use std::fmt;

use crate::ban::{BlameReason, StoreError};
use crate::blind::BlindError;
use crate::chain::ChainError;
use crate::pool::{MixStatus, PoolId};
use crate::tx0::Tx0Error;
use crate::util::signature::SignatureError;

/// Protocol error codes reported to clients alongside the message.
pub mod code {
    pub const INVALID_ARGUMENT: u32 = 400;
    pub const NOT_FOUND: u32 = 404;
    pub const SERVER_ERROR: u32 = 500;
    pub const INPUT_REJECTED: u32 = 501;
    pub const INPUT_ALREADY_REGISTERED: u32 = 502;
    pub const QUEUE_FULL: u32 = 503;
    pub const MIX_STATE: u32 = 504;
    pub const TX_REJECTED: u32 = 510;
}

/// Coarse classification of an [`Error`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    NotFound,
    AlreadyRegistered,
    IllegalInput,
    Banned,
    QueueFull,
    MixState,
    Infrastructure,
    Broadcast,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Usage(String),
    #[error("Pool not found: {0}")]
    PoolNotFound(PoolId),
    #[error("Mix not found: {0}")]
    MixNotFound(String),
    #[error("{0} already registered")]
    AlreadyRegistered(String),
    #[error("Illegal input: {0}")]
    IllegalInput(String),
    #[error("Input signature: {0}")]
    InputSignature(#[from] SignatureError),
    #[error("Tx0: {0}")]
    Tx0(#[from] Tx0Error),
    #[error("Banned from service ({reason})")]
    Banned {
        identifier: String,
        reason: BlameReason,
    },
    #[error("Queue full in pool {pool_id} ({depth} inputs waiting)")]
    QueueFull { pool_id: PoolId, depth: usize },
    #[error("Mix {mix_id} is in {status}, cannot {operation}")]
    MixState {
        mix_id: String,
        status: MixStatus,
        operation: &'static str,
    },
    #[error("Chain node: {0}")]
    Chain(#[from] ChainError),
    #[error("Ban ledger: {0}")]
    Ledger(#[from] StoreError),
    #[error("Tx0 push rejected: {0}")]
    PushTx(PushTxError),
    #[error("Broadcast rejected: {0}")]
    Broadcast(String),
    #[error("Blind signature: {0}")]
    Blind(#[from] BlindError),
    #[error("Internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) => ErrorKind::Usage,
            Error::PoolNotFound(_) | Error::MixNotFound(_) => ErrorKind::NotFound,
            Error::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            Error::IllegalInput(_) | Error::InputSignature(_) | Error::Tx0(_) => {
                ErrorKind::IllegalInput
            }
            Error::Banned { .. } => ErrorKind::Banned,
            Error::QueueFull { .. } => ErrorKind::QueueFull,
            Error::MixState { .. } => ErrorKind::MixState,
            Error::Chain(_) | Error::Ledger(_) => ErrorKind::Infrastructure,
            Error::PushTx(_) | Error::Broadcast(_) => ErrorKind::Broadcast,
            Error::Blind(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Numeric code sent to clients.
    pub fn code(&self) -> u32 {
        match self.kind() {
            ErrorKind::Usage => code::INVALID_ARGUMENT,
            ErrorKind::NotFound => code::NOT_FOUND,
            ErrorKind::AlreadyRegistered => code::INPUT_ALREADY_REGISTERED,
            ErrorKind::IllegalInput | ErrorKind::Banned => code::INPUT_REJECTED,
            ErrorKind::QueueFull => code::QUEUE_FULL,
            ErrorKind::MixState => code::MIX_STATE,
            ErrorKind::Broadcast => code::TX_REJECTED,
            ErrorKind::Infrastructure | ErrorKind::Internal => code::SERVER_ERROR,
        }
    }
}

/// Rejection of a pushed Tx0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTxError {
    pub message: String,
    pub push_tx_error_code: Option<String>,
    /// Output indices paying addresses that were already used.
    pub vouts_address_reuse: Vec<u32>,
}

impl fmt::Display for PushTxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.push_tx_error_code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes() {
        let banned = Error::Banned {
            identifier: "abcd".to_owned(),
            reason: BlameReason::MissingOutput,
        };
        assert_eq!(banned.kind(), ErrorKind::Banned);
        assert_eq!(banned.code(), code::INPUT_REJECTED);
        assert!(banned.to_string().starts_with("Banned from service"));

        let full = Error::QueueFull {
            pool_id: PoolId::from("0.01btc"),
            depth: 10,
        };
        assert_eq!(full.code(), code::QUEUE_FULL);
        assert_eq!(
            Error::PoolNotFound(PoolId::from("0.5btc")).code(),
            code::NOT_FOUND
        );
    }
}
