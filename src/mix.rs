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

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use bitcoin::secp256k1::Secp256k1;
use bitcoin::{OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::ban::{BanLedger, BlameReason, BlameRecord, BlameScope, LedgerEntry};
use crate::blind::BlindSigner;
use crate::events::{EvictionReason, MixEvent};
use crate::input::{QuarantineReason, RegisteredInput};
use crate::pool::{MixStatus, PoolId};
use crate::util::{self, bip69, signature};
use crate::Error;

/// How long a mix may stay in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixTimeouts {
    pub register_input: Duration,
    pub confirm_input: Duration,
    pub register_output: Duration,
    pub reveal_output: Duration,
    pub signing: Duration,
}

impl Default for MixTimeouts {
    fn default() -> Self {
        Self {
            register_input: Duration::from_secs(600),
            confirm_input: Duration::from_secs(60),
            register_output: Duration::from_secs(60),
            reveal_output: Duration::from_secs(60),
            signing: Duration::from_secs(60),
        }
    }
}

/// Parameters a mix inherits from its pool.
#[derive(Debug, Clone)]
pub struct MixParams {
    pub pool_id: PoolId,
    pub denomination: u64,
    pub anonymity_set: usize,
    pub min_anonymity_set: usize,
    pub min_must_mix: usize,
    pub timeouts: MixTimeouts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailReason {
    NotEnoughLiquidity,
    MissingOutput,
    InvalidSignature,
    SigningTimeout,
    BannedInput,
    BroadcastError,
    Aborted,
    Shutdown,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailReason::NotEnoughLiquidity => "NOT_ENOUGH_LIQUIDITY",
            FailReason::MissingOutput => "MISSING_OUTPUT",
            FailReason::InvalidSignature => "INVALID_SIGNATURE",
            FailReason::SigningTimeout => "SIGNING_TIMEOUT",
            FailReason::BannedInput => "BANNED_INPUT",
            FailReason::BroadcastError => "BROADCAST_ERROR",
            FailReason::Aborted => "ABORTED",
            FailReason::Shutdown => "SHUTDOWN",
        })
    }
}

/// Side effects of a mix transition, applied by the pool while it still holds its lock
/// (requeues, blames) or by the coordinator once the lock is released (events, broadcast).
#[derive(Debug, Default)]
pub struct Outcome {
    pub events: Vec<MixEvent>,
    pub requeue: Vec<RegisteredInput>,
    pub blames: Vec<BlameRecord>,
    pub broadcast: Option<Transaction>,
    /// Set when the triggering request itself is refused even though the mix moved on.
    pub rejection: Option<Error>,
    /// Blames already applied to the ledger but not yet written to its store.
    pub ledger_entries: Vec<LedgerEntry>,
}

impl Outcome {
    pub fn merge(&mut self, other: Outcome) {
        self.events.extend(other.events);
        self.requeue.extend(other.requeue);
        self.blames.extend(other.blames);
        self.ledger_entries.extend(other.ledger_entries);
        if other.broadcast.is_some() {
            self.broadcast = other.broadcast;
        }
        if other.rejection.is_some() {
            self.rejection = other.rejection;
        }
    }

    fn event(event: MixEvent) -> Self {
        Outcome {
            events: vec![event],
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct ConfirmedInput {
    pub input: RegisteredInput,
    pub user_hash: String,
}

#[derive(Debug)]
enum State {
    RegisterInput,
    ConfirmInput,
    RegisterOutput {
        inputs_hash: String,
    },
    RevealOutput {
        inputs_hash: String,
        revealed: HashMap<OutPoint, Script>,
    },
    Signing {
        tx: Transaction,
        witnesses: HashMap<OutPoint, Witness>,
    },
    /// Fully signed, handed to the chain node.
    Broadcasting {
        tx: Transaction,
    },
    Success {
        txid: Txid,
        tx: Transaction,
    },
    Fail {
        reason: FailReason,
    },
}

/// Coordinator side of a single mix. Inputs come in through [`Mix::admit`]; every other
/// transition is driven by participant requests or by [`Mix::tick`] once the state's deadline
/// has passed.
#[derive(Debug)]
pub struct Mix {
    id: String,
    params: MixParams,
    signer: Box<dyn BlindSigner>,
    created: Instant,
    deadline: Instant,
    finished: Option<Instant>,
    state: State,
    confirming: Vec<RegisteredInput>,
    confirmed: Vec<ConfirmedInput>,
    outputs: Vec<Script>,
    commitments: HashSet<Vec<u8>>,
}

impl Mix {
    pub fn new(params: MixParams, signer: Box<dyn BlindSigner>, now: Instant) -> Self {
        let deadline = now + params.timeouts.register_input;
        Mix {
            id: new_mix_id(),
            params,
            signer,
            created: now,
            deadline,
            finished: None,
            state: State::RegisterInput,
            confirming: Vec::new(),
            confirmed: Vec::new(),
            outputs: Vec::new(),
            commitments: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool_id(&self) -> &PoolId {
        &self.params.pool_id
    }

    pub fn params(&self) -> &MixParams {
        &self.params
    }

    pub fn signer(&self) -> &dyn BlindSigner {
        self.signer.as_ref()
    }

    pub fn status(&self) -> MixStatus {
        match self.state {
            State::RegisterInput => MixStatus::RegisterInput,
            State::ConfirmInput => MixStatus::ConfirmInput,
            State::RegisterOutput { .. } => MixStatus::RegisterOutput,
            State::RevealOutput { .. } => MixStatus::RevealOutput,
            State::Signing { .. } | State::Broadcasting { .. } => MixStatus::Signing,
            State::Success { .. } => MixStatus::Success,
            State::Fail { .. } => MixStatus::Fail,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Success { .. } | State::Fail { .. })
    }

    pub fn inputs_hash(&self) -> Option<&str> {
        match &self.state {
            State::RegisterOutput { inputs_hash } | State::RevealOutput { inputs_hash, .. } => {
                Some(inputs_hash)
            }
            _ => None,
        }
    }

    pub fn fail_reason(&self) -> Option<FailReason> {
        match self.state {
            State::Fail { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn txid(&self) -> Option<Txid> {
        match &self.state {
            State::Success { txid, .. } => Some(*txid),
            _ => None,
        }
    }

    /// The mix transaction, once assembled.
    pub fn transaction(&self) -> Option<&Transaction> {
        match &self.state {
            State::Signing { tx, .. } | State::Broadcasting { tx } | State::Success { tx, .. } => {
                Some(tx)
            }
            _ => None,
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.finished
            .unwrap_or(now)
            .saturating_duration_since(self.created)
    }

    pub fn nb_confirming(&self) -> usize {
        self.confirming.len()
    }

    pub fn nb_confirmed(&self) -> usize {
        self.confirmed.len()
    }

    pub fn outputs(&self) -> &[Script] {
        &self.outputs
    }

    /// Counts of (mustMix, liquidity) inputs admitted so far.
    pub fn composition(&self) -> (usize, usize) {
        self.inputs()
            .fold((0, 0), |(must_mix, liquidity), input| match input.liquidity {
                true => (must_mix, liquidity + 1),
                false => (must_mix + 1, liquidity),
            })
    }

    pub fn is_full(&self) -> bool {
        self.confirming.len() + self.confirmed.len() >= self.params.anonymity_set
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.inputs().any(|i| i.outpoint() == outpoint)
    }

    pub fn find_input_mut(&mut self, outpoint: &OutPoint) -> Option<&mut RegisteredInput> {
        self.confirming
            .iter_mut()
            .chain(self.confirmed.iter_mut().map(|c| &mut c.input))
            .find(|i| i.outpoint() == outpoint)
    }

    fn inputs(&self) -> impl Iterator<Item = &RegisteredInput> {
        self.confirming
            .iter()
            .chain(self.confirmed.iter().map(|c| &c.input))
    }

    fn usernames(&self) -> Vec<String> {
        self.inputs().map(|i| i.username.clone()).collect()
    }

    /// Adds an input while registrations are open. Gives the input back otherwise.
    pub fn admit(&mut self, input: RegisteredInput) -> Result<(), RegisteredInput> {
        if !matches!(self.state, State::RegisterInput) || self.is_full() {
            return Err(input);
        }

        debug!(
            "mix {}: admitted {} ({})",
            self.id,
            input.outpoint(),
            if input.liquidity { "liquidity" } else { "mustMix" }
        );
        self.confirming.push(input);
        Ok(())
    }

    /// Removes admitted but unconfirmed inputs matching `pred`. Confirmed and quarantined
    /// inputs stay, their fate is decided by the later deadlines.
    pub fn evict_unconfirmed<F: Fn(&RegisteredInput) -> bool>(
        &mut self,
        pred: F,
    ) -> Vec<RegisteredInput> {
        if !matches!(self.state, State::RegisterInput | State::ConfirmInput) {
            return Vec::new();
        }

        let (evicted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.confirming)
            .into_iter()
            .partition(|i| !i.is_quarantined() && pred(i));
        self.confirming = kept;
        evicted
    }

    fn meets_minimums<'a, I>(&self, inputs: I) -> bool
    where
        I: Iterator<Item = &'a RegisteredInput>,
    {
        let (total, must_mix) = inputs.fold((0, 0), |(total, must_mix), i| {
            (total + 1, must_mix + usize::from(!i.liquidity))
        });
        must_mix >= self.params.min_must_mix && total >= self.params.min_anonymity_set
    }

    /// Closes registrations and invites every admitted participant to confirm.
    pub fn start_confirmation(&mut self, now: Instant) -> Outcome {
        if !matches!(self.state, State::RegisterInput) {
            return Outcome::default();
        }

        info!(
            "mix {} [{}]: {} inputs, moving to CONFIRM_INPUT",
            self.id,
            self.params.pool_id,
            self.confirming.len()
        );

        self.state = State::ConfirmInput;
        self.deadline = now + self.params.timeouts.confirm_input;

        let public_key = self.signer.public_key_der().to_vec();
        let events = self
            .confirming
            .iter()
            .map(|input| MixEvent::ConfirmInputInvite {
                pool_id: self.params.pool_id.clone(),
                mix_id: self.id.clone(),
                username: input.username.clone(),
                public_key: public_key.clone(),
            })
            .collect();

        Outcome {
            events,
            ..Default::default()
        }
    }

    /// Blind-signs a participant's bordereau. Returns the blind signature.
    pub fn confirm_input(
        &mut self,
        username: &str,
        blinded_bordereau: &[u8],
        user_hash: &str,
        now: Instant,
    ) -> Result<(Vec<u8>, Outcome), Error> {
        self.expect_state(MixStatus::ConfirmInput, "confirm input")?;

        let index = match self.confirming.iter().position(|i| i.username == username) {
            Some(index) => index,
            None if self.confirmed.iter().any(|c| c.input.username == username) => {
                return Err(Error::AlreadyRegistered("Input confirmation".to_owned()));
            }
            None => {
                return Err(Error::Usage(format!(
                    "no input of {} awaiting confirmation in mix {}",
                    username, self.id
                )))
            }
        };

        if self.confirming[index].is_quarantined() {
            return Err(Error::IllegalInput("input is quarantined".to_owned()));
        }

        let reused = self.confirmed.iter().any(|c| c.user_hash == user_hash);
        let remix_with_self = self.confirming[index].last_user_hash.as_deref() == Some(user_hash);
        if reused || remix_with_self {
            let input = &mut self.confirming[index];
            input.quarantine = Some(if reused {
                QuarantineReason::UserHashReused
            } else {
                QuarantineReason::RemixWithSelf
            });

            warn!(
                "mix {}: quarantined {} ({:?})",
                self.id,
                input.outpoint(),
                input.quarantine
            );
            return Err(Error::IllegalInput(
                "user hash already used for this mix".to_owned(),
            ));
        }

        let signed_bordereau = self.signer.blind_sign(blinded_bordereau)?;

        let input = self.confirming.remove(index);
        debug!("mix {}: confirmed {}", self.id, input.outpoint());
        self.confirmed.push(ConfirmedInput {
            input,
            user_hash: user_hash.to_owned(),
        });

        let mut outcome = Outcome::event(MixEvent::InputConfirmed {
            pool_id: self.params.pool_id.clone(),
            mix_id: self.id.clone(),
            username: username.to_owned(),
            signed_bordereau: signed_bordereau.clone(),
        });

        if self.confirming.is_empty() {
            outcome.merge(self.start_output_registration(now));
        }

        Ok((signed_bordereau, outcome))
    }

    fn start_output_registration(&mut self, now: Instant) -> Outcome {
        let inputs_hash = util::hashes::inputs_hash(self.confirmed.iter().map(|c| c.input.outpoint()));

        info!(
            "mix {} [{}]: {} inputs confirmed, moving to REGISTER_OUTPUT",
            self.id,
            self.params.pool_id,
            self.confirmed.len()
        );

        self.state = State::RegisterOutput {
            inputs_hash: inputs_hash.clone(),
        };
        self.deadline = now + self.params.timeouts.register_output;

        Outcome::event(MixEvent::RegisterOutputInvite {
            pool_id: self.params.pool_id.clone(),
            mix_id: self.id.clone(),
            inputs_hash,
            usernames: self.usernames(),
        })
    }

    /// Records a verified output. `commitment` is what the blind signature covered, it may only
    /// be redeemed once.
    pub fn add_output(
        &mut self,
        commitment: Vec<u8>,
        script: Script,
        now: Instant,
        ledger: &BanLedger,
    ) -> Result<Outcome, Error> {
        self.expect_state(MixStatus::RegisterOutput, "register output")?;

        if self.commitments.contains(&commitment) {
            return Err(Error::AlreadyRegistered("Bordereau".to_owned()));
        }
        if self.outputs.contains(&script) {
            return Err(Error::AlreadyRegistered("Output".to_owned()));
        }
        if self.outputs.len() >= self.confirmed.len() {
            return Err(Error::Usage("all outputs are registered".to_owned()));
        }

        self.commitments.insert(commitment);
        self.outputs.push(script);
        debug!(
            "mix {}: output {}/{} registered",
            self.id,
            self.outputs.len(),
            self.confirmed.len()
        );

        if self.outputs.len() == self.confirmed.len() {
            return Ok(self.start_signing(now, ledger));
        }

        Ok(Outcome::default())
    }

    fn start_signing(&mut self, now: Instant, ledger: &BanLedger) -> Outcome {
        // a ban may have landed on one of the inputs while the mix was running
        let banned: Vec<_> = self
            .confirmed
            .iter()
            .filter_map(|c| ledger.is_banned(c.input.outpoint(), c.input.liquidity))
            .collect();
        if !banned.is_empty() {
            warn!(
                "mix {}: {} inputs banned since admission",
                self.id,
                banned.len()
            );
            let (banned_inputs, clean): (Vec<_>, Vec<_>) = std::mem::take(&mut self.confirmed)
                .into_iter()
                .map(|c| c.input)
                .partition(|i| ledger.is_banned(i.outpoint(), i.liquidity).is_some());
            let usernames = banned_inputs
                .iter()
                .chain(clean.iter())
                .map(|i| i.username.clone())
                .collect();
            return self.fail(FailReason::BannedInput, now, clean, Vec::new(), usernames);
        }

        let tx = self.assemble_tx();

        info!(
            "mix {} [{}]: all outputs registered, moving to SIGNING",
            self.id, self.params.pool_id
        );

        self.state = State::Signing {
            tx: tx.clone(),
            witnesses: HashMap::new(),
        };
        self.deadline = now + self.params.timeouts.signing;

        Outcome::event(MixEvent::SigningInvite {
            pool_id: self.params.pool_id.clone(),
            mix_id: self.id.clone(),
            transaction: tx,
            usernames: self.usernames(),
        })
    }

    /// Unsigned mix transaction: BIP69 ordered inputs and outputs, every output paying the
    /// denomination.
    fn assemble_tx(&self) -> Transaction {
        let mut outpoints: Vec<_> = self.confirmed.iter().map(|c| *c.input.outpoint()).collect();
        outpoints.sort_by(|a, b| bip69::ComparableOutpoint(a).cmp(&bip69::ComparableOutpoint(b)));

        let mut outputs: Vec<_> = self
            .outputs
            .iter()
            .map(|script| TxOut {
                value: self.params.denomination,
                script_pubkey: script.clone(),
            })
            .collect();
        outputs.sort_by(|a, b| bip69::ComparableTxOut(a).cmp(&bip69::ComparableTxOut(b)));

        Transaction {
            version: 1,
            lock_time: PackedLockTime::ZERO,
            input: outpoints
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: Script::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        }
    }

    /// Proves that a confirmed participant registered `script`. Used once registrations timed
    /// out to find who did not.
    pub fn reveal_output(
        &mut self,
        username: &str,
        script: Script,
        now: Instant,
    ) -> Result<Outcome, Error> {
        self.expect_state(MixStatus::RevealOutput, "reveal output")?;

        let outpoint = *self
            .confirmed
            .iter()
            .find(|c| c.input.username == username)
            .ok_or_else(|| Error::Usage(format!("{} has no confirmed input", username)))?
            .input
            .outpoint();

        if !self.outputs.contains(&script) {
            return Err(Error::IllegalInput("output was not registered".to_owned()));
        }

        let all_revealed = match &mut self.state {
            State::RevealOutput { revealed, .. } => {
                if revealed.contains_key(&outpoint) || revealed.values().any(|s| *s == script) {
                    return Err(Error::AlreadyRegistered("Revealed output".to_owned()));
                }
                revealed.insert(outpoint, script);
                revealed.len() == self.outputs.len()
            }
            _ => false,
        };

        if all_revealed {
            return Ok(self.close_reveal(now));
        }

        Ok(Outcome::default())
    }

    /// Verifies and stores a participant's witness. An invalid witness fails the mix; the
    /// returned outcome then carries the rejection.
    pub fn sign(
        &mut self,
        username: &str,
        witness: Vec<Vec<u8>>,
        now: Instant,
    ) -> Result<Outcome, Error> {
        self.expect_state(MixStatus::Signing, "sign")?;

        let input = self
            .confirmed
            .iter()
            .map(|c| &c.input)
            .find(|i| i.username == username)
            .ok_or_else(|| Error::Usage(format!("{} has no input to sign", username)))?
            .clone();

        let verified = match &mut self.state {
            State::Signing { tx, witnesses } => {
                if witnesses.contains_key(input.outpoint()) {
                    return Err(Error::AlreadyRegistered("Signature".to_owned()));
                }

                let index = tx
                    .input
                    .iter()
                    .position(|txin| txin.previous_output == *input.outpoint())
                    .ok_or_else(|| Error::Internal("input missing from mix tx".to_owned()))?;

                let mut signed = tx.clone();
                signed.input[index].witness = Witness::from_vec(witness);

                let secp = Secp256k1::verification_only();
                match signature::verify_p2wpkh_input(&secp, &signed, index, &input.utxo.txout()) {
                    Ok(()) => {
                        witnesses.insert(*input.outpoint(), signed.input[index].witness.clone());
                        Ok(witnesses.len() == tx.input.len())
                    }
                    Err(e) => Err(e),
                }
            }
            _ => return Err(Error::Internal("mix left SIGNING".to_owned())),
        };

        match verified {
            Ok(true) => Ok(self.finalize()),
            Ok(false) => Ok(Outcome::default()),
            Err(e) => {
                warn!("mix {}: invalid signature for {}: {}", self.id, input.outpoint(), e);

                let blame = BlameRecord::for_input(
                    &input,
                    BlameScope::Utxo,
                    BlameReason::InvalidSignature,
                    &self.id,
                );
                let usernames = self.usernames();
                let others = self.take_confirmed_except(|i| i.outpoint() == input.outpoint());
                let mut outcome =
                    self.fail(FailReason::InvalidSignature, now, others, vec![blame], usernames);
                outcome.rejection = Some(Error::InputSignature(e));
                Ok(outcome)
            }
        }
    }

    fn finalize(&mut self) -> Outcome {
        let tx = match &self.state {
            State::Signing { tx, witnesses } => {
                let mut tx = tx.clone();
                for txin in &mut tx.input {
                    if let Some(witness) = witnesses.get(&txin.previous_output) {
                        txin.witness = witness.clone();
                    }
                }
                tx
            }
            _ => return Outcome::default(),
        };

        info!("mix {}: fully signed, broadcasting {}", self.id, tx.txid());
        self.state = State::Broadcasting { tx: tx.clone() };

        Outcome {
            broadcast: Some(tx),
            ..Default::default()
        }
    }

    /// Concludes a broadcast handed out through [`Outcome::broadcast`]. Broadcasts are never
    /// retried: a rejection fails the mix and returns every input.
    pub fn on_broadcast(&mut self, result: Result<Txid, String>, now: Instant) -> Outcome {
        let tx = match &self.state {
            State::Broadcasting { tx } => tx.clone(),
            _ => return Outcome::default(),
        };

        match result {
            Ok(txid) => {
                self.finished = Some(now);
                self.state = State::Success { txid, tx };
                info!(
                    "mix {} [{}]: SUCCESS {} after {:?}",
                    self.id,
                    self.params.pool_id,
                    txid,
                    self.elapsed(now)
                );

                let usernames = self.usernames();
                self.confirmed.clear();
                Outcome::event(MixEvent::MixSuccess {
                    pool_id: self.params.pool_id.clone(),
                    mix_id: self.id.clone(),
                    txid,
                    usernames,
                })
            }
            Err(message) => {
                error!("mix {}: broadcast failed: {}", self.id, message);
                let usernames = self.usernames();
                let inputs = self.take_confirmed_except(|_| false);
                self.fail(FailReason::BroadcastError, now, inputs, Vec::new(), usernames)
            }
        }
    }

    /// Applies the current state's deadline, if it has passed.
    pub fn tick(&mut self, now: Instant, ledger: &BanLedger) -> Outcome {
        if now < self.deadline {
            return Outcome::default();
        }

        match self.state {
            State::RegisterInput => {
                if self.confirming.is_empty() {
                    self.deadline = now + self.params.timeouts.register_input;
                    Outcome::default()
                } else if self.meets_minimums(self.confirming.iter()) {
                    self.start_confirmation(now)
                } else {
                    self.fail_returning_all(FailReason::NotEnoughLiquidity, now)
                }
            }
            State::ConfirmInput => self.close_confirmation(now),
            State::RegisterOutput { .. } => self.start_reveal(now, ledger),
            State::RevealOutput { .. } => self.close_reveal(now),
            State::Signing { .. } => self.close_signing(now),
            State::Broadcasting { .. } | State::Success { .. } | State::Fail { .. } => {
                Outcome::default()
            }
        }
    }

    fn close_confirmation(&mut self, now: Instant) -> Outcome {
        let mut outcome = Outcome::default();

        for input in std::mem::take(&mut self.confirming) {
            if input.is_quarantined() {
                outcome.blames.push(BlameRecord::for_input(
                    &input,
                    BlameScope::Rule,
                    BlameReason::ConfirmationTimeout,
                    &self.id,
                ));
                outcome.events.push(MixEvent::InputEvicted {
                    pool_id: self.params.pool_id.clone(),
                    username: input.username.clone(),
                    outpoint: *input.outpoint(),
                    reason: EvictionReason::Banned,
                });
            } else {
                debug!("mix {}: {} did not confirm, requeued", self.id, input.outpoint());
                outcome.requeue.push(input);
            }
        }

        if self.meets_minimums(self.confirmed.iter().map(|c| &c.input)) {
            outcome.merge(self.start_output_registration(now));
        } else {
            outcome.merge(self.fail_returning_all(FailReason::NotEnoughLiquidity, now));
        }

        outcome
    }

    fn start_reveal(&mut self, now: Instant, ledger: &BanLedger) -> Outcome {
        if self.outputs.len() == self.confirmed.len() {
            return self.start_signing(now, ledger);
        }

        let inputs_hash = self.inputs_hash().unwrap_or_default().to_owned();
        warn!(
            "mix {}: {}/{} outputs registered, moving to REVEAL_OUTPUT",
            self.id,
            self.outputs.len(),
            self.confirmed.len()
        );

        self.state = State::RevealOutput {
            inputs_hash,
            revealed: HashMap::new(),
        };
        self.deadline = now + self.params.timeouts.reveal_output;

        Outcome::event(MixEvent::RevealOutputInvite {
            pool_id: self.params.pool_id.clone(),
            mix_id: self.id.clone(),
            usernames: self.usernames(),
        })
    }

    fn close_reveal(&mut self, now: Instant) -> Outcome {
        let revealed: HashSet<OutPoint> = match &self.state {
            State::RevealOutput { revealed, .. } => revealed.keys().copied().collect(),
            _ => return Outcome::default(),
        };

        let usernames = self.usernames();
        let mut blames = Vec::new();
        let mut returned = Vec::new();
        for confirmed in std::mem::take(&mut self.confirmed) {
            if revealed.contains(confirmed.input.outpoint()) {
                returned.push(confirmed.input);
            } else {
                blames.push(BlameRecord::for_input(
                    &confirmed.input,
                    BlameScope::Utxo,
                    BlameReason::MissingOutput,
                    &self.id,
                ));
            }
        }

        self.fail(FailReason::MissingOutput, now, returned, blames, usernames)
    }

    fn close_signing(&mut self, now: Instant) -> Outcome {
        let signed: HashSet<OutPoint> = match &self.state {
            State::Signing { witnesses, .. } => witnesses.keys().copied().collect(),
            _ => return Outcome::default(),
        };

        let usernames = self.usernames();
        let mut blames = Vec::new();
        let mut returned = Vec::new();
        for confirmed in std::mem::take(&mut self.confirmed) {
            if signed.contains(confirmed.input.outpoint()) {
                returned.push(confirmed.input);
            } else {
                blames.push(BlameRecord::for_input(
                    &confirmed.input,
                    BlameScope::Utxo,
                    BlameReason::SigningTimeout,
                    &self.id,
                ));
            }
        }

        self.fail(FailReason::SigningTimeout, now, returned, blames, usernames)
    }

    /// Operator abort or shutdown. Refused while the transaction is being broadcast.
    pub fn abort(&mut self, reason: FailReason, now: Instant) -> Result<Outcome, Error> {
        if self.is_terminal() || matches!(self.state, State::Broadcasting { .. }) {
            return Err(Error::MixState {
                mix_id: self.id.clone(),
                status: self.status(),
                operation: "abort",
            });
        }

        Ok(self.fail_returning_all(reason, now))
    }

    fn fail_returning_all(&mut self, reason: FailReason, now: Instant) -> Outcome {
        let usernames = self.usernames();
        let mut inputs = std::mem::take(&mut self.confirming);
        inputs.extend(self.take_confirmed_except(|_| false));
        self.fail(reason, now, inputs, Vec::new(), usernames)
    }

    fn take_confirmed_except<F: Fn(&RegisteredInput) -> bool>(
        &mut self,
        excluded: F,
    ) -> Vec<RegisteredInput> {
        std::mem::take(&mut self.confirmed)
            .into_iter()
            .map(|c| {
                let mut input = c.input;
                input.last_user_hash = Some(c.user_hash);
                input
            })
            .filter(|i| !excluded(i))
            .collect()
    }

    fn fail(
        &mut self,
        reason: FailReason,
        now: Instant,
        requeue: Vec<RegisteredInput>,
        blames: Vec<BlameRecord>,
        usernames: Vec<String>,
    ) -> Outcome {
        info!(
            "mix {} [{}]: FAIL {} ({} inputs requeued, {} blamed)",
            self.id,
            self.params.pool_id,
            reason,
            requeue.len(),
            blames.len()
        );

        self.confirming.clear();
        self.confirmed.clear();
        self.finished = Some(now);
        self.state = State::Fail { reason };

        let requeued: HashSet<&str> = requeue.iter().map(|i| i.username.as_str()).collect();
        let dropped = usernames
            .iter()
            .filter(|username| !requeued.contains(username.as_str()))
            .cloned()
            .collect();

        Outcome {
            events: vec![MixEvent::MixFail {
                pool_id: self.params.pool_id.clone(),
                mix_id: self.id.clone(),
                reason,
                usernames,
                dropped,
            }],
            requeue,
            blames,
            ..Default::default()
        }
    }

    fn expect_state(&self, expected: MixStatus, operation: &'static str) -> Result<(), Error> {
        let status = self.status();
        if status != expected || matches!(self.state, State::Broadcasting { .. }) {
            return Err(Error::MixState {
                mix_id: self.id.clone(),
                status,
                operation,
            });
        }
        Ok(())
    }
}

fn new_mix_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
