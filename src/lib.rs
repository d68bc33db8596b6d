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

//! A Whirlpool coordinator: pools of equal-denomination CoinJoin mixes, the Tx0 fee scheme that
//! funds them, and the blame ledger that keeps disruptive participants out.
//!
//! [`Coordinator`] is the entry point. It owns the pools and every collaborator, and all
//! protocol operations go through it. Timers are advanced by [`Coordinator::tick`], which
//! [`MixDriver`] calls from a background thread. Transports sit on top: [`api`] holds the wire
//! payloads and REST endpoints, [`directory`] the message-directory path.

pub mod api;
pub mod ban;
pub mod blind;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod events;
pub mod input;
pub mod mix;
pub mod output;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod tx0;
pub mod util;

#[cfg(test)]
mod testutil;

pub use bitcoin;

pub use ban::{BanLedger, BlameStore, FileBlameStore, MemoryBlameStore};
pub use blind::{BlindKeySource, RsaKeySource};
#[cfg(feature = "rpc")]
pub use chain::BitcoindRpc;
pub use chain::{ChainNode, RetryingChainNode};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, InputOrigin, InputRequest, MixDriver};
pub use error::Error;
pub use events::MixEvent;
pub use pool::PoolId;
