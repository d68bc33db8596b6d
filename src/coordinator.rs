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

//! The coordinator ties the pools, the ban ledger and the chain node together. Every client
//! operation and the timer tick enter here.
//!
//! Pool state is only ever touched under the pool's own lock. Chain reads happen before the
//! lock is taken; broadcasts, event delivery and ledger persistence once it is released.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bitcoin::consensus::encode;
use bitcoin::hashes::hex::FromHex;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::ban::{BanLedger, BlameStore};
use crate::blind::BlindKeySource;
use crate::chain::{ChainError, ChainNode};
use crate::config::CoordinatorConfig;
use crate::error::PushTxError;
use crate::events::{Listener, MixEvent};
use crate::input::{RegisteredInput, SorobanInputMeta, UtxoOutPoint};
use crate::mix::{FailReason, Outcome};
use crate::output::{OutputRegistration, OutputService};
use crate::pool::{Pool, PoolId};
use crate::queue::Registration;
use crate::registry::{PoolHandle, PoolRegistry, PoolSummary};
use crate::tx0::{self, Tx0Data, Tx0Error, Tx0Service};
use crate::util::signature;
use crate::Error;

/// Where an input registration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOrigin {
    /// A client connection authenticated as `username`.
    Direct { username: String, over_tor: bool },
    /// A registration read from the directory, posted by `sender`.
    Directory { sender: String },
}

/// A `registerInput` request.
#[derive(Debug, Clone)]
pub struct InputRequest {
    pub pool_id: PoolId,
    pub outpoint: OutPoint,
    /// Bitcoin signed message over the pool id by the key owning the UTXO.
    pub signature: String,
    pub liquidity: bool,
    pub origin: InputOrigin,
}

impl InputRequest {
    /// Name the registered input goes by in the mix and its events. Directory registrations
    /// are named after their outpoint, since one sender may register several.
    pub fn username(&self) -> String {
        match &self.origin {
            InputOrigin::Direct { username, .. } => username.clone(),
            InputOrigin::Directory { .. } => format!("soroban:{}", self.outpoint),
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: PoolRegistry,
    ledger: BanLedger,
    chain: Arc<dyn ChainNode>,
    tx0: Tx0Service,
    outputs: OutputService,
    key_source: Box<dyn BlindKeySource>,
    listeners: RwLock<Vec<Listener>>,
    secp: Secp256k1<VerifyOnly>,
}

impl Coordinator {
    /// Builds the pools of `config`, each with a fresh mix, and replays the ban ledger.
    pub fn new(
        config: CoordinatorConfig,
        chain: Arc<dyn ChainNode>,
        store: Box<dyn BlameStore>,
        key_source: Box<dyn BlindKeySource>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let tx0 = Tx0Service::new(
            config.network,
            config.tx0_keys()?,
            config.scodes.clone(),
            config.partners.clone(),
        )?
        .with_epoch_grace(config.fee_epoch_grace_blocks);
        let ledger = BanLedger::open(store)?;

        let now = Instant::now();
        let mut pools = Vec::with_capacity(config.pools.len());
        for pool_config in &config.pools {
            pools.push(Pool::new(
                pool_config.clone(),
                config.mix_timeouts(),
                config.max_queue_depth,
                config.min_relay_fee_per_vbyte,
                key_source.generate()?,
                now,
            ));
        }
        let registry = PoolRegistry::new(pools)?;

        info!(
            "coordinator ready on {}: {} pools, payment code {}",
            config.network,
            registry.pools().len(),
            tx0.payment_code()
        );

        Ok(Self {
            outputs: OutputService::new(config.network),
            config,
            registry,
            ledger,
            chain,
            tx0,
            key_source,
            listeners: RwLock::new(Vec::new()),
            secp: Secp256k1::verification_only(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &BanLedger {
        &self.ledger
    }

    pub fn tx0(&self) -> &Tx0Service {
        &self.tx0
    }

    /// Registers a listener for every [`MixEvent`]. Listeners run on the thread that caused
    /// the event, never under a pool lock.
    pub fn on_event<F: Fn(&MixEvent) + Send + Sync + 'static>(&self, listener: F) {
        let listener: Listener = Box::new(listener);
        self.listeners.write().push(listener);
    }

    pub fn list_pools(&self, now: Instant) -> Vec<PoolSummary> {
        self.registry.summaries(now)
    }

    /// Validates an input against the chain, then queues it. The input joins the current mix
    /// right away if it has a free seat for it.
    pub fn register_input(&self, request: InputRequest, now: Instant) -> Result<Registration, Error> {
        debug!(
            "registerInput {} in {} (liquidity: {})",
            request.outpoint, request.pool_id, request.liquidity
        );
        let handle = self.registry.pool(&request.pool_id)?;
        let (bounds, fees, denomination) = {
            let pool = handle.lock();
            (pool.bounds(), pool.fees().clone(), pool.denomination())
        };

        let (tx, confirmations) = self.fetch_transaction(&request.outpoint.txid)?;
        let txout = tx
            .output
            .get(request.outpoint.vout as usize)
            .ok_or_else(|| Error::IllegalInput(format!("no such output: {}", request.outpoint)))?
            .clone();

        if !txout.script_pubkey.is_v0_p2wpkh() {
            return Err(Error::IllegalInput(format!(
                "{} is not a P2WPKH output",
                request.outpoint
            )));
        }
        if !self.chain.is_tx_out_unspent(&request.outpoint)? {
            return Err(Error::IllegalInput(format!("{} is spent", request.outpoint)));
        }

        signature::verify_message_owner(
            &self.secp,
            &request.signature,
            request.pool_id.as_ref(),
            &txout.script_pubkey,
        )?;

        if request.liquidity {
            if txout.value != denomination {
                return Err(Error::IllegalInput(format!(
                    "liquidity must be worth {} sats, got {}",
                    denomination, txout.value
                )));
            }
            if confirmations < self.config.min_confirmations_liquidity {
                return Err(Error::IllegalInput(format!(
                    "liquidity needs {} confirmations, has {}",
                    self.config.min_confirmations_liquidity, confirmations
                )));
            }
        } else {
            if !bounds.contains(txout.value) {
                return Err(Error::IllegalInput(format!(
                    "mustMix value {} outside [{}, {}]",
                    txout.value, bounds.min, bounds.max
                )));
            }
            if confirmations < self.config.min_confirmations_must_mix {
                return Err(Tx0Error::Confirmations {
                    confirmations,
                    required: self.config.min_confirmations_must_mix,
                }
                .into());
            }
            // mined `confirmations - 1` blocks below the tip
            let height = (self.chain.block_height()? + 1).saturating_sub(u64::from(confirmations));
            self.tx0.validate(&tx, &request.pool_id, &fees, height)?;
        }

        let input = registered_input(&request, &txout, confirmations, now);
        let (registration, outcome) = {
            let mut pool = handle.lock();
            pool.admit(input, &self.ledger, now)?
        };

        info!(
            "input {} registered in {} ({:?})",
            request.outpoint, request.pool_id, registration
        );
        self.finish(handle, outcome, now)?;
        Ok(registration)
    }

    /// Blind signs the bordereau of a participant of mix `mix_id`.
    pub fn confirm_input(
        &self,
        mix_id: &str,
        username: &str,
        blinded_bordereau: &[u8],
        user_hash: &str,
        now: Instant,
    ) -> Result<Vec<u8>, Error> {
        debug!("confirmInput {} by {}", mix_id, username);
        let handle = self.mix_handle(mix_id)?;
        let (signed, outcome) = handle.lock().confirm_input(
            mix_id,
            username,
            blinded_bordereau,
            user_hash,
            now,
            &self.ledger,
        )?;
        self.finish(&handle, outcome, now)?;
        Ok(signed)
    }

    pub fn check_output(&self, receive_address: &str, signature: &[u8]) -> Result<(), Error> {
        debug!("checkOutput {}", receive_address);
        self.outputs
            .check_output(&self.registry, receive_address, signature)
    }

    pub fn register_output(
        &self,
        request: &OutputRegistration<'_>,
        now: Instant,
    ) -> Result<(), Error> {
        debug!("registerOutput {}", request.receive_address);
        let (handle, outcome) =
            self.outputs
                .register_output(&self.registry, &self.ledger, request, now)?;
        self.finish(&handle, outcome, now)
    }

    pub fn reveal_output(
        &self,
        mix_id: &str,
        username: &str,
        receive_address: &str,
        now: Instant,
    ) -> Result<(), Error> {
        debug!("revealOutput {} by {}", mix_id, username);
        let script = self.outputs.parse_address(receive_address)?.script_pubkey();
        let handle = self.mix_handle(mix_id)?;
        let outcome = handle
            .lock()
            .reveal_output(mix_id, username, script, now, &self.ledger)?;
        self.finish(&handle, outcome, now)
    }

    /// Stores a witness. The last one triggers the broadcast, done by the calling thread once
    /// the pool lock is released.
    pub fn sign(
        &self,
        mix_id: &str,
        username: &str,
        witness: Vec<Vec<u8>>,
        now: Instant,
    ) -> Result<(), Error> {
        debug!("signing {} by {}", mix_id, username);
        let handle = self.mix_handle(mix_id)?;
        let outcome = handle
            .lock()
            .sign(mix_id, username, witness, now, &self.ledger)?;
        self.finish(&handle, outcome, now)
    }

    /// Drops the direct registrations of a closed connection from every pool.
    pub fn disconnect(&self, username: &str, now: Instant) {
        debug!("disconnect {}", username);
        for handle in self.registry.pools() {
            let outcome = handle.lock().disconnect(username, now, &self.ledger);
            if let Err(e) = self.finish(handle, outcome, now) {
                warn!("pool {}: disconnect of {}: {}", handle.id(), username, e);
            }
        }
    }

    /// Fails the current mix of `pool_id`. Nobody is banned.
    pub fn abort_mix(&self, pool_id: &PoolId, now: Instant) -> Result<(), Error> {
        let handle = self.registry.pool(pool_id)?;
        warn!("pool {}: mix aborted by operator", pool_id);
        let outcome = handle
            .lock()
            .abort(FailReason::Aborted, now, &self.ledger)?;
        self.finish(handle, outcome, now)
    }

    pub fn lift_ban(&self, identifier: &str) -> Result<bool, Error> {
        Ok(self.ledger.lift_ban(identifier)?)
    }

    /// Starts a new fee epoch for `pool_id`. Returns the epoch.
    pub fn set_pool_fee(&self, pool_id: &PoolId, fee_value: u64) -> Result<u32, Error> {
        let handle = self.registry.pool(pool_id)?;
        let height = self.chain.block_height()?;
        let epoch = handle.lock().set_fee(fee_value, height);
        info!("pool {}: fee epoch {} at height {}: {} sats", pool_id, epoch, height, fee_value);
        Ok(epoch)
    }

    /// Fails every running mix. Mixes already broadcasting are left to finish.
    pub fn shutdown(&self, now: Instant) {
        info!("coordinator shutting down");
        for handle in self.registry.pools() {
            let aborted = {
                let mut pool = handle.lock();
                if pool.mix().is_terminal() {
                    continue;
                }
                pool.abort(FailReason::Shutdown, now, &self.ledger)
            };

            match aborted {
                Ok(outcome) => {
                    if let Err(e) = self.finish(handle, outcome, now) {
                        warn!("pool {}: shutdown: {}", handle.id(), e);
                    }
                }
                Err(e) => warn!("pool {}: mix left running: {}", handle.id(), e),
            }
        }
    }

    /// One quote per pool.
    pub fn quote_tx0(
        &self,
        scode: Option<&str>,
        partner_id: Option<&str>,
    ) -> Result<Vec<Tx0Data>, Error> {
        self.registry
            .pools()
            .iter()
            .map(|handle| {
                let fees = handle.lock().fees().clone();
                self.tx0.quote(handle.id(), &fees, scode, partner_id)
            })
            .collect()
    }

    /// Validates a Tx0 for `pool_id` and broadcasts it. Its premix addresses must not have
    /// been used before.
    pub fn push_tx0(&self, tx_hex: &str, pool_id: &PoolId) -> Result<Txid, Error> {
        let tx: Transaction = Vec::<u8>::from_hex(tx_hex)
            .ok()
            .and_then(|bytes| encode::deserialize(&bytes).ok())
            .ok_or_else(|| Error::IllegalInput("invalid transaction".to_owned()))?;
        debug!("pushTx0 {} for {}", tx.txid(), pool_id);

        let handle = self.registry.pool(pool_id)?;
        let (bounds, fees, max_outputs) = {
            let pool = handle.lock();
            (pool.bounds(), pool.fees().clone(), pool.config().tx0_max_outputs)
        };

        let height = self.chain.block_height()? + 1;
        self.tx0.validate(&tx, pool_id, &fees, height)?;

        let premix = tx0::premix_outputs(&tx, &bounds);
        if premix.len() > usize::from(max_outputs) {
            return Err(Tx0Error::TooManyOutputs {
                count: premix.len(),
                max: max_outputs,
            }
            .into());
        }

        let reused: Vec<u32> = premix
            .iter()
            .filter(|(_, output)| self.outputs.is_used(&output.script_pubkey))
            .map(|(vout, _)| *vout)
            .collect();
        if !reused.is_empty() {
            warn!("pushTx0 {}: address reuse at {:?}", tx.txid(), reused);
            return Err(Error::PushTx(PushTxError {
                message: "Address reuse".to_owned(),
                push_tx_error_code: Some("ADDRESS_REUSE".to_owned()),
                vouts_address_reuse: reused,
            }));
        }

        let txid = self.chain.broadcast(&tx).map_err(|e| match e {
            ChainError::Rpc { message, .. } => Error::PushTx(PushTxError {
                message,
                push_tx_error_code: None,
                vouts_address_reuse: Vec::new(),
            }),
            e => Error::Chain(e),
        })?;

        self.outputs
            .mark_used(premix.iter().map(|&(_, output)| &output.script_pubkey));
        info!("pushTx0 {}: {} premix outputs", txid, premix.len());
        Ok(txid)
    }

    /// Timer duties of every pool. A failing pool does not hold back the others.
    pub fn tick(&self, now: Instant) {
        if self.ledger.nb_pending() > 0 {
            if let Err(e) = self.ledger.flush() {
                error!("ban ledger: still failing: {}", e);
            }
        }

        for handle in self.registry.pools() {
            // key generation is slow, keep it away from the pool lock
            if handle.lock().needs_signer() {
                match self.key_source.generate() {
                    Ok(signer) => handle.lock().stock_signer(signer),
                    Err(e) => error!("pool {}: failed to generate a mix key: {}", handle.id(), e),
                }
            }

            let outcome = handle
                .lock()
                .tick(now, &self.ledger, self.config.liveness_timeout());
            if let Err(e) = self.finish(handle, outcome, now) {
                warn!("pool {}: tick: {}", handle.id(), e);
            }
        }
    }

    fn fetch_transaction(&self, txid: &Txid) -> Result<(Transaction, u32), Error> {
        let raw = self
            .chain
            .raw_transaction(txid)?
            .ok_or_else(|| Error::IllegalInput(format!("unknown transaction {}", txid)))?;
        Ok((raw.decode()?, raw.confirmations))
    }

    fn mix_handle(&self, mix_id: &str) -> Result<Arc<PoolHandle>, Error> {
        self.registry
            .pools()
            .iter()
            .find(|handle| handle.lock().mix().id() == mix_id)
            .cloned()
            .ok_or_else(|| Error::MixNotFound(mix_id.to_owned()))
    }

    /// Applies the parts of an outcome that must not run under the pool lock. Returns the
    /// outcome's rejection, if any.
    fn finish(&self, handle: &PoolHandle, outcome: Outcome, now: Instant) -> Result<(), Error> {
        if let Err(e) = self.ledger.persist(&outcome.ledger_entries) {
            error!("ban ledger: write failed, {} entries kept for retry: {}", self.ledger.nb_pending(), e);
        }

        self.emit(&outcome.events);

        if let Some(tx) = outcome.broadcast {
            let result = self.chain.broadcast(&tx).map_err(|e| e.to_string());
            let concluded = {
                let mut pool = handle.lock();
                let mix_id = pool.mix().id().to_owned();
                pool.on_broadcast(&mix_id, result, now, &self.ledger)
            };
            match concluded {
                Ok(concluded) => self.finish(handle, concluded, now)?,
                Err(e) => error!("pool {}: broadcast result lost: {}", handle.id(), e),
            }
        }

        match outcome.rejection {
            Some(rejection) => Err(rejection),
            None => Ok(()),
        }
    }

    fn emit(&self, events: &[MixEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read();
        for event in events {
            debug!("event {:?}", event);
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }
}

fn registered_input(
    request: &InputRequest,
    txout: &TxOut,
    confirmations: u32,
    now: Instant,
) -> RegisteredInput {
    let (over_tor, soroban) = match &request.origin {
        InputOrigin::Direct { over_tor, .. } => (*over_tor, None),
        InputOrigin::Directory { sender } => (
            true,
            Some(SorobanInputMeta {
                sender: sender.clone(),
                last_seen: now,
            }),
        ),
    };

    RegisteredInput {
        pool_id: request.pool_id.clone(),
        username: request.username(),
        liquidity: request.liquidity,
        utxo: UtxoOutPoint::new(request.outpoint, txout, confirmations),
        over_tor,
        last_user_hash: None,
        enrolled_at: now,
        soroban,
        quarantine: None,
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("network", &self.config.network)
            .field("registry", &self.registry)
            .field("ledger", &self.ledger)
            .finish()
    }
}

/// Ticks a coordinator from a background thread.
pub struct MixDriver {
    stop: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl MixDriver {
    pub fn start(coordinator: Arc<Coordinator>) -> Self {
        let (stop, stopped) = mpsc::channel();
        let interval = coordinator.config().tick_interval();

        let thread = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => coordinator.tick(Instant::now()),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("mix driver stopped");
                    break;
                }
            }
        });

        Self { stop, thread }
    }

    /// Stops ticking and waits for the current tick to end.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            error!("mix driver panicked");
        }
    }
}
