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
use std::time::{Duration, Instant};

use bitcoin::Script;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::ban::BanLedger;
use crate::blind::BlindSigner;
use crate::events::{EvictionReason, MixEvent};
use crate::input::RegisteredInput;
use crate::mix::{FailReason, Mix, MixParams, MixTimeouts, Outcome};
use crate::queue::{AdmissionPolicy, PoolQueues, QueueError, Registration};
use crate::util::fee;
use crate::Error;

/// Represents the unique identifier of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl From<&str> for PoolId {
    fn from(value: &str) -> Self {
        PoolId(value.to_owned())
    }
}

impl From<String> for PoolId {
    fn from(value: String) -> Self {
        PoolId(value)
    }
}

impl AsRef<str> for PoolId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MixStatus {
    RegisterInput,
    ConfirmInput,
    RegisterOutput,
    RevealOutput,
    Signing,
    Success,
    Fail,
}

impl fmt::Display for MixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MixStatus::RegisterInput => "REGISTER_INPUT",
            MixStatus::ConfirmInput => "CONFIRM_INPUT",
            MixStatus::RegisterOutput => "REGISTER_OUTPUT",
            MixStatus::RevealOutput => "REVEAL_OUTPUT",
            MixStatus::Signing => "SIGNING",
            MixStatus::Success => "SUCCESS",
            MixStatus::Fail => "FAIL",
        })
    }
}

/// A pool as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_id: PoolId,
    pub denomination: u64,
    /// Coordinator fee charged by Tx0s entering the pool.
    pub fee_value: u64,
    /// Miner fee bounds a mustMix input carries on top of the denomination.
    pub miner_fee_min: u64,
    pub miner_fee_cap: u64,
    pub miner_fee_max: u64,
    pub anonymity_set: usize,
    pub min_anonymity_set: usize,
    pub min_must_mix: usize,
    pub tx0_max_outputs: u16,
}

/// Every fee value a pool ever charged. A Tx0 commits to the epoch it was quoted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSchedule(Vec<FeeEpoch>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FeeEpoch {
    value: u64,
    /// Chain height at which the next epoch took over.
    superseded_at: Option<u64>,
}

impl FeeSchedule {
    pub fn new(initial: u64) -> Self {
        Self(vec![FeeEpoch {
            value: initial,
            superseded_at: None,
        }])
    }

    /// Current `(epoch, fee_value)`.
    pub fn current(&self) -> (u32, u64) {
        let epoch = self.0.len().saturating_sub(1);
        let value = self.0.get(epoch).map(|e| e.value).unwrap_or_default();
        (epoch as u32, value)
    }

    pub fn at(&self, epoch: u32) -> Option<u64> {
        self.0.get(epoch as usize).map(|e| e.value)
    }

    /// Fee owed by a Tx0 quoted under `epoch` and mined at `height`. An older epoch is honoured
    /// for `grace_blocks` after it was superseded, or for good when it charged no less than the
    /// current one.
    pub fn accepts(&self, epoch: u32, height: u64, grace_blocks: u64) -> Result<u64, FeeEpochError> {
        let entry = self
            .0
            .get(epoch as usize)
            .ok_or(FeeEpochError::Unknown(epoch))?;

        match entry.superseded_at {
            None => Ok(entry.value),
            Some(_) if entry.value >= self.current().1 => Ok(entry.value),
            Some(at) if height <= at.saturating_add(grace_blocks) => Ok(entry.value),
            Some(at) => Err(FeeEpochError::Expired { epoch, at }),
        }
    }

    pub(crate) fn push(&mut self, fee_value: u64, height: u64) -> u32 {
        if let Some(last) = self.0.last_mut() {
            last.superseded_at = Some(height);
        }
        self.0.push(FeeEpoch {
            value: fee_value,
            superseded_at: None,
        });
        self.current().0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeeEpochError {
    #[error("unknown fee epoch {0}")]
    Unknown(u32),
    #[error("fee epoch {epoch} expired at height {at}")]
    Expired { epoch: u32, at: u64 },
}

/// Acceptable values of a mustMix input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceBounds {
    pub min: u64,
    pub cap: u64,
    pub max: u64,
}

impl BalanceBounds {
    pub fn new(config: &PoolConfig, min_relay_fee_per_vbyte: u64) -> Self {
        let relay_share = fee::must_mix_fee_share(
            config.min_anonymity_set,
            config.min_must_mix,
            min_relay_fee_per_vbyte,
        );
        let min = config.miner_fee_min.max(relay_share);
        let cap = config.miner_fee_cap.max(min);
        let max = config.miner_fee_max.max(cap);

        Self {
            min: config.denomination + min,
            cap: config.denomination + cap,
            max: config.denomination + max,
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Live state of a pool: both queues and the current mix. Lives behind the pool's mutex;
/// every method expects the caller to hold it.
#[derive(Debug)]
pub struct Pool {
    config: PoolConfig,
    fees: FeeSchedule,
    bounds: BalanceBounds,
    timeouts: MixTimeouts,
    queues: PoolQueues,
    mix: Mix,
    /// Key for the next mix, generated ahead of time outside the pool lock.
    next_signer: Option<Box<dyn BlindSigner>>,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        timeouts: MixTimeouts,
        max_queue_depth: usize,
        min_relay_fee_per_vbyte: u64,
        signer: Box<dyn BlindSigner>,
        now: Instant,
    ) -> Self {
        let bounds = BalanceBounds::new(&config, min_relay_fee_per_vbyte);
        let fees = FeeSchedule::new(config.fee_value);
        let params = mix_params(&config, timeouts);

        Pool {
            config,
            fees,
            bounds,
            timeouts,
            queues: PoolQueues::new(max_queue_depth),
            mix: Mix::new(params, signer, now),
            next_signer: None,
        }
    }

    pub fn id(&self) -> &PoolId {
        &self.config.pool_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn denomination(&self) -> u64 {
        self.config.denomination
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn bounds(&self) -> BalanceBounds {
        self.bounds
    }

    pub fn queues(&self) -> &PoolQueues {
        &self.queues
    }

    pub fn mix(&self) -> &Mix {
        &self.mix
    }

    /// Inputs waiting in a queue or admitted to the mix but not yet confirmed.
    pub fn nb_registered(&self) -> usize {
        self.mix.nb_confirming() + self.queues.len()
    }

    pub fn nb_confirmed(&self) -> usize {
        self.mix.nb_confirmed()
    }

    /// Starts a new fee epoch at chain `height`. Quotes issued under older epochs stay valid
    /// per [`FeeSchedule::accepts`].
    pub fn set_fee(&mut self, fee_value: u64, height: u64) -> u32 {
        let epoch = self.fees.push(fee_value, height);
        info!("pool {}: fee set to {} (epoch {})", self.id(), fee_value, epoch);
        epoch
    }

    fn policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            anonymity_set: self.config.anonymity_set,
            min_must_mix: self.config.min_must_mix,
        }
    }

    /// Ban check, duplicate check and insertion, then admission into the mix if a seat is
    /// free.
    pub fn admit(
        &mut self,
        input: RegisteredInput,
        ledger: &BanLedger,
        now: Instant,
    ) -> Result<(Registration, Outcome), Error> {
        if let Some(ban) = ledger.is_banned(input.outpoint(), input.liquidity) {
            warn!(
                "pool {}: rejected banned input {} ({})",
                self.id(),
                input.outpoint(),
                ban.reason
            );
            return Err(Error::Banned {
                identifier: ban.identifier,
                reason: ban.reason,
            });
        }

        if let Some(existing) = self.mix.find_input_mut(input.outpoint()) {
            return if existing.same_identity(&input) {
                existing.refresh(now);
                Ok((Registration::Refreshed, Outcome::default()))
            } else {
                Err(Error::AlreadyRegistered("Input".to_owned()))
            };
        }

        let registration = match self.queues.register(input, now) {
            Ok(registration) => registration,
            Err(QueueError::AlreadyQueued) => {
                return Err(Error::AlreadyRegistered("Input".to_owned()))
            }
            Err(QueueError::Full { depth }) => {
                return Err(Error::QueueFull {
                    pool_id: self.id().clone(),
                    depth,
                })
            }
        };

        Ok((registration, self.fill_mix(now, ledger)))
    }

    /// Moves queued inputs into the mix while it accepts registrations. Queued inputs banned
    /// in the meantime are dropped.
    fn fill_mix(&mut self, now: Instant, ledger: &BanLedger) -> Outcome {
        if self.mix.status() != MixStatus::RegisterInput {
            return Outcome::default();
        }

        let policy = self.policy();
        let mut banned = Vec::new();
        loop {
            let (must_mix, liquidity) = self.mix.composition();
            let next = match self.queues.next_for_mix(must_mix, liquidity, &policy) {
                Some(next) => next,
                None => break,
            };

            if ledger.is_banned(next.outpoint(), next.liquidity).is_some() {
                warn!("pool {}: dropped banned input {}", self.id(), next.outpoint());
                banned.push(next);
                continue;
            }

            if let Err(input) = self.mix.admit(next) {
                self.queues.requeue(input);
                break;
            }
        }

        let mut outcome = evictions(self.id(), banned, EvictionReason::Banned);
        if self.mix.is_full() {
            outcome.merge(self.mix.start_confirmation(now));
        }
        outcome
    }

    /// Requeues the inputs an outcome hands back and records its blames in the ledger.
    fn settle(&mut self, mut outcome: Outcome, ledger: &BanLedger) -> Outcome {
        for input in outcome.requeue.drain(..) {
            self.queues.requeue(input);
        }

        for blame in &outcome.blames {
            outcome.ledger_entries.push(ledger.record(blame.clone()));
        }

        outcome
    }

    fn current_mix(&mut self, mix_id: &str) -> Result<&mut Mix, Error> {
        if self.mix.id() != mix_id {
            return Err(Error::MixNotFound(mix_id.to_owned()));
        }
        Ok(&mut self.mix)
    }

    pub fn confirm_input(
        &mut self,
        mix_id: &str,
        username: &str,
        blinded_bordereau: &[u8],
        user_hash: &str,
        now: Instant,
        ledger: &BanLedger,
    ) -> Result<(Vec<u8>, Outcome), Error> {
        let (signed, outcome) =
            self.current_mix(mix_id)?
                .confirm_input(username, blinded_bordereau, user_hash, now)?;
        Ok((signed, self.settle(outcome, ledger)))
    }

    /// Adds an output whose blind signature has already been verified.
    pub fn add_output(
        &mut self,
        commitment: Vec<u8>,
        script: Script,
        now: Instant,
        ledger: &BanLedger,
    ) -> Result<Outcome, Error> {
        let outcome = self.mix.add_output(commitment, script, now, ledger)?;
        Ok(self.settle(outcome, ledger))
    }

    pub fn reveal_output(
        &mut self,
        mix_id: &str,
        username: &str,
        script: Script,
        now: Instant,
        ledger: &BanLedger,
    ) -> Result<Outcome, Error> {
        let outcome = self
            .current_mix(mix_id)?
            .reveal_output(username, script, now)?;
        Ok(self.settle(outcome, ledger))
    }

    pub fn sign(
        &mut self,
        mix_id: &str,
        username: &str,
        witness: Vec<Vec<u8>>,
        now: Instant,
        ledger: &BanLedger,
    ) -> Result<Outcome, Error> {
        let outcome = self.current_mix(mix_id)?.sign(username, witness, now)?;
        Ok(self.settle(outcome, ledger))
    }

    pub fn on_broadcast(
        &mut self,
        mix_id: &str,
        result: Result<bitcoin::Txid, String>,
        now: Instant,
        ledger: &BanLedger,
    ) -> Result<Outcome, Error> {
        let outcome = self.current_mix(mix_id)?.on_broadcast(result, now);
        Ok(self.settle(outcome, ledger))
    }

    /// Removes a disconnected participant's direct inputs from the queues and from a mix that
    /// has not yet confirmed them. Nobody is banned for leaving early.
    pub fn disconnect(&mut self, username: &str, now: Instant, ledger: &BanLedger) -> Outcome {
        let mut removed = self.queues.disconnect(username);
        removed.extend(
            self.mix
                .evict_unconfirmed(|i| !i.is_soroban_origin() && i.username == username),
        );

        let mut outcome = evictions(self.id(), removed, EvictionReason::Disconnected);
        outcome.merge(self.fill_mix(now, ledger));
        outcome
    }

    pub fn abort(
        &mut self,
        reason: FailReason,
        now: Instant,
        ledger: &BanLedger,
    ) -> Result<Outcome, Error> {
        let outcome = self.mix.abort(reason, now)?;
        Ok(self.settle(outcome, ledger))
    }

    pub fn needs_signer(&self) -> bool {
        self.next_signer.is_none()
    }

    /// Stocks the key the next mix will be signed with. Each key serves a single mix.
    pub fn stock_signer(&mut self, signer: Box<dyn BlindSigner>) {
        self.next_signer = Some(signer);
    }

    /// Timer duties: replace a finished mix once a key is stocked, sweep stale directory
    /// registrations, apply the mix deadline and refill the mix.
    pub fn tick(&mut self, now: Instant, ledger: &BanLedger, liveness_timeout: Duration) -> Outcome {
        let mut outcome = Outcome::default();

        if self.mix.is_terminal() {
            match self.next_signer.take() {
                Some(signer) => {
                    self.mix = Mix::new(mix_params(&self.config, self.timeouts), signer, now);
                    info!("pool {}: new mix {}", self.id(), self.mix.id());
                    outcome.events.push(MixEvent::MixStarted {
                        pool_id: self.id().clone(),
                        mix_id: self.mix.id().to_owned(),
                    });
                }
                None => warn!("pool {}: no signing key for the next mix yet", self.id()),
            }
        }

        let mut stale = self.queues.sweep_stale(now, liveness_timeout);
        if self.mix.status() == MixStatus::RegisterInput {
            stale.extend(
                self.mix
                    .evict_unconfirmed(|i| i.is_stale(now, liveness_timeout)),
            );
        }
        if !stale.is_empty() {
            debug!("pool {}: swept {} stale inputs", self.id(), stale.len());
        }
        outcome.merge(evictions(self.id(), stale, EvictionReason::Stale));

        let deadline = self.mix.tick(now, ledger);
        outcome.merge(self.settle(deadline, ledger));
        outcome.merge(self.fill_mix(now, ledger));

        outcome
    }
}

fn mix_params(config: &PoolConfig, timeouts: MixTimeouts) -> MixParams {
    MixParams {
        pool_id: config.pool_id.clone(),
        denomination: config.denomination,
        anonymity_set: config.anonymity_set,
        min_anonymity_set: config.min_anonymity_set,
        min_must_mix: config.min_must_mix,
        timeouts,
    }
}

fn evictions(pool_id: &PoolId, inputs: Vec<RegisteredInput>, reason: EvictionReason) -> Outcome {
    Outcome {
        events: inputs
            .into_iter()
            .map(|input| MixEvent::InputEvicted {
                pool_id: pool_id.clone(),
                username: input.username.clone(),
                outpoint: *input.outpoint(),
                reason,
            })
            .collect(),
        ..Default::default()
    }
}
