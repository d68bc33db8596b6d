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

//! Pool entry fee. Quotes handed to clients and verification of the Tx0s they build from them.
//!
//! A Tx0 carries an 80 byte OP_RETURN: the first 46 bytes hold the [`FeePayload`] and its
//! authentication tag, masked with a BIP47 blinding factor shared between the client's one-time
//! key (bytes 46..79) and the coordinator's notification key, keyed by the Tx0's first input.
//! The tag is an HMAC by the coordinator over the payload and the pool id, so a client can only
//! commit to terms it was actually quoted.

use std::sync::atomic::{AtomicU32, Ordering};

use bitcoin::blockdata::script::Instruction;
use bitcoin::hashes::{hmac, sha256, Hash, HashEngine};
use bitcoin::secp256k1::{self, All, Secp256k1, SecretKey};
use bitcoin::util::bip32::{self, ChildNumber, ExtendedPubKey};
use bitcoin::{Address, Network, PrivateKey, Script, Transaction, TxOut, Txid};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::pool::{BalanceBounds, FeeEpochError, FeeSchedule, PoolId};
use crate::util::bip47::{self, PaymentCode, PaymentCodeKey};
use crate::util::signature::{self, SignatureError};
use crate::util::z85;
use crate::Error;

const FEE_PAYLOAD_VERSION: u16 = 1;
pub const FEE_PAYLOAD_LENGTH: usize = 14;
pub const OP_RETURN_LENGTH: usize = 80;
pub const MASKED_LENGTH: usize = 46;
const TAG_LENGTH: usize = MASKED_LENGTH - FEE_PAYLOAD_LENGTH;
const BLINDING_KEY_END: usize = MASKED_LENGTH + 33;

/// Blocks during which a superseded fee epoch is still honoured.
pub const DEFAULT_EPOCH_GRACE_BLOCKS: u64 = 6;

/// What a Tx0 commits to, readable only by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePayload {
    pub fee_index: u32,
    /// `0` when no scode was applied.
    pub scode: u16,
    pub partner: u16,
    pub fee_epoch: u32,
}

impl FeePayload {
    pub fn to_bytes(&self) -> [u8; FEE_PAYLOAD_LENGTH] {
        let mut bytes = [0_u8; FEE_PAYLOAD_LENGTH];
        bytes[0..2].copy_from_slice(&FEE_PAYLOAD_VERSION.to_be_bytes());
        bytes[2..6].copy_from_slice(&self.fee_index.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.scode.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.partner.to_be_bytes());
        bytes[10..14].copy_from_slice(&self.fee_epoch.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Tx0Error> {
        if bytes.len() < FEE_PAYLOAD_LENGTH {
            return Err(Tx0Error::Payload("too short"));
        }

        let u16_at = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        let u32_at =
            |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let version = u16_at(0);
        if version != FEE_PAYLOAD_VERSION {
            return Err(Tx0Error::PayloadVersion(version));
        }

        Ok(Self {
            fee_index: u32_at(2),
            scode: u16_at(6),
            partner: u16_at(8),
            fee_epoch: u32_at(10),
        })
    }
}

/// A promotional code granting a fee discount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScodeConfig {
    pub scode: String,
    /// Value committed to in fee payloads. Must not be `0`.
    pub payload: u16,
    pub discount_percent: u8,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerConfig {
    pub partner_id: String,
    pub payload: u16,
}

/// Everything a client needs to build a Tx0 for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx0Data {
    pub pool_id: PoolId,
    pub fee_payment_code: String,
    pub fee_value: u64,
    /// Deposited back to the client when the fee is waived entirely.
    pub fee_change: u64,
    pub fee_discount_percent: u8,
    pub message: Option<String>,
    pub fee_payload_64: String,
    pub fee_address: Option<String>,
    pub fee_output_signature: String,
}

/// The coordinator keys the Tx0 flow depends on.
#[derive(Debug, Clone)]
pub struct Tx0Keys {
    /// Fee addresses are its normal children, one per fee index.
    pub fee_xpub: ExtendedPubKey,
    pub payment_code: PaymentCodeKey,
    /// Signs fee output pre-images.
    pub message_key: PrivateKey,
}

/// The fee a validated Tx0 paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx0Fee {
    pub payload: FeePayload,
    pub expected: u64,
    pub paid: u64,
    /// `None` when the fee was waived.
    pub fee_vout: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum Tx0Error {
    #[error("no fee payload")]
    MissingPayload,
    #[error("fee payload {0}")]
    Payload(&'static str),
    #[error("unsupported fee payload version {0}")]
    PayloadVersion(u16),
    #[error("fee payload was not issued by this coordinator for this pool")]
    PayloadAuthentication,
    #[error("{0}")]
    FeeEpoch(#[from] FeeEpochError),
    #[error("unknown scode payload {0}")]
    ScodePayload(u16),
    #[error("no fee output to {0}")]
    FeeOutputMissing(Address),
    #[error("fee mismatch: expected {expected} sats, paid {paid}")]
    FeeMismatch { expected: u64, paid: u64 },
    #[error("{count} premix outputs exceed the pool maximum of {max}")]
    TooManyOutputs { count: usize, max: u16 },
    #[error("{confirmations} confirmations, {required} required")]
    Confirmations { confirmations: u32, required: u32 },
    #[error("transaction {0} not found")]
    NotFound(Txid),
    #[error("BIP47: {0}")]
    Bip47(#[from] bip47::Error),
    #[error("BIP32: {0}")]
    Bip32(#[from] bip32::Error),
    #[error("fee address: {0}")]
    Address(#[from] bitcoin::util::address::Error),
    #[error("signature: {0}")]
    Signature(#[from] SignatureError),
    #[error("secp256k1: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// Issues quotes and checks the Tx0s built from them.
pub struct Tx0Service {
    secp: Secp256k1<All>,
    network: Network,
    keys: Tx0Keys,
    payment_code: PaymentCode,
    notification_secret: SecretKey,
    payload_key: [u8; 32],
    scodes: Vec<ScodeConfig>,
    partners: Vec<PartnerConfig>,
    next_fee_index: AtomicU32,
    epoch_grace_blocks: u64,
}

impl Tx0Service {
    pub fn new(
        network: Network,
        keys: Tx0Keys,
        scodes: Vec<ScodeConfig>,
        partners: Vec<PartnerConfig>,
    ) -> Result<Self, Error> {
        if let Some(scode) = scodes.iter().find(|s| s.payload == 0) {
            return Err(Error::Usage(format!("scode {} needs a non-zero payload", scode.scode)));
        }
        if let Some(scode) = scodes.iter().find(|s| s.discount_percent > 100) {
            return Err(Error::Usage(format!(
                "scode {} discounts more than 100%",
                scode.scode
            )));
        }

        let secp = Secp256k1::new();
        let payment_code = keys.payment_code.payment_code(&secp);
        let notification_secret = keys
            .payment_code
            .notification_secret(&secp)
            .map_err(Tx0Error::from)?;

        let mut engine = sha256::Hash::engine();
        engine.input(b"whirlpool/fee-payload");
        engine.input(&keys.message_key.inner.secret_bytes());
        let payload_key = sha256::Hash::from_engine(engine).into_inner();

        Ok(Self {
            secp,
            network,
            keys,
            payment_code,
            notification_secret,
            payload_key,
            scodes,
            partners,
            next_fee_index: AtomicU32::new(0),
            epoch_grace_blocks: DEFAULT_EPOCH_GRACE_BLOCKS,
        })
    }

    pub fn with_epoch_grace(mut self, blocks: u64) -> Self {
        self.epoch_grace_blocks = blocks;
        self
    }

    fn payload_tag(&self, pool_id: &PoolId, payload: &[u8]) -> [u8; TAG_LENGTH] {
        let mut engine = hmac::HmacEngine::<sha256::Hash>::new(&self.payload_key);
        engine.input(payload);
        engine.input(pool_id.as_ref().as_bytes());
        hmac::Hmac::<sha256::Hash>::from_engine(engine).into_inner()
    }

    pub fn payment_code(&self) -> &PaymentCode {
        &self.payment_code
    }

    fn scode(&self, scode: &str) -> Option<&ScodeConfig> {
        self.scodes
            .iter()
            .find(|s| s.scode.eq_ignore_ascii_case(scode))
    }

    /// Builds a quote against the pool's current fee epoch. Every quote reserves a fresh fee
    /// index. An unknown partner falls back to the default one.
    pub fn quote(
        &self,
        pool_id: &PoolId,
        fees: &FeeSchedule,
        scode: Option<&str>,
        partner_id: Option<&str>,
    ) -> Result<Tx0Data, Error> {
        let scode = match scode {
            Some(code) => Some(
                self.scode(code)
                    .ok_or_else(|| Error::Usage(format!("Unknown scode: {}", code)))?,
            ),
            None => None,
        };
        let partner = partner_id
            .and_then(|id| self.partners.iter().find(|p| p.partner_id == id))
            .map(|p| p.payload)
            .unwrap_or_default();

        let (fee_epoch, pool_fee) = fees.current();
        let discount_percent = scode.map(|s| s.discount_percent).unwrap_or_default();
        let fee_index = self.next_fee_index.fetch_add(1, Ordering::Relaxed);

        let payload = FeePayload {
            fee_index,
            scode: scode.map(|s| s.payload).unwrap_or_default(),
            partner,
            fee_epoch,
        };

        let (fee_value, fee_change, fee_address) = if discount_percent >= 100 {
            (0, pool_fee, None)
        } else {
            let address = self.fee_address(fee_index).map_err(Error::Tx0)?;
            (discounted(pool_fee, discount_percent), 0, Some(address))
        };

        let fee_output_signature = self
            .fee_output_signature(pool_id, fee_epoch, fee_index, fee_address.as_ref())
            .map_err(Error::Tx0)?;

        debug!(
            "tx0 quote for {}: epoch {}, index {}, fee {}",
            pool_id, fee_epoch, fee_index, fee_value
        );

        let mut fee_payload = payload.to_bytes().to_vec();
        let tag = self.payload_tag(pool_id, &fee_payload);
        fee_payload.extend_from_slice(&tag);

        Ok(Tx0Data {
            pool_id: pool_id.clone(),
            fee_payment_code: self.payment_code.to_string(),
            fee_value,
            fee_change,
            fee_discount_percent: discount_percent,
            message: scode.and_then(|s| s.message.clone()),
            fee_payload_64: z85::encode(&fee_payload),
            fee_address: fee_address.map(|a| a.to_string()),
            fee_output_signature,
        })
    }

    /// Address expected to receive the fee committed to under `fee_index`.
    pub fn fee_address(&self, fee_index: u32) -> Result<Address, Tx0Error> {
        let child = self
            .keys
            .fee_xpub
            .ckd_pub(&self.secp, ChildNumber::from_normal_idx(fee_index)?)?;
        Ok(Address::p2wpkh(
            &bitcoin::PublicKey::new(child.public_key),
            self.network,
        )?)
    }

    fn fee_output_signature(
        &self,
        pool_id: &PoolId,
        fee_epoch: u32,
        fee_index: u32,
        fee_address: Option<&Address>,
    ) -> Result<String, Tx0Error> {
        let preimage = fee_output_preimage(pool_id, fee_epoch, fee_index, fee_address);
        let signature =
            signature::sign_message(&self.secp, &self.keys.message_key.inner, &preimage)?;
        Ok(signature.to_base64())
    }

    /// Recovers the fee payload hidden in a Tx0 and checks it was quoted for `pool_id`.
    pub fn unmask_payload(&self, tx: &Transaction, pool_id: &PoolId) -> Result<FeePayload, Tx0Error> {
        let first_input = tx
            .input
            .first()
            .ok_or(Tx0Error::Payload("needs an input to unmask"))?
            .previous_output;

        let data = tx
            .output
            .iter()
            .find_map(|output| op_return_data(&output.script_pubkey))
            .filter(|data| data.len() == OP_RETURN_LENGTH)
            .ok_or(Tx0Error::MissingPayload)?;

        let blinding_key = secp256k1::PublicKey::from_slice(&data[MASKED_LENGTH..BLINDING_KEY_END])?;
        let factor = bip47::blinding_factor(&self.notification_secret, &blinding_key, &first_input)?;

        let unmasked: Vec<u8> = data[..MASKED_LENGTH]
            .iter()
            .zip(factor.iter())
            .map(|(byte, mask)| byte ^ mask)
            .collect();

        let (payload, tag) = unmasked.split_at(FEE_PAYLOAD_LENGTH);
        if tag != &self.payload_tag(pool_id, payload)[..] {
            return Err(Tx0Error::PayloadAuthentication);
        }

        FeePayload::from_bytes(payload)
    }

    /// Checks that `tx`, mined at `height`, paid the fee its payload commits to. Never blames
    /// anyone: a Tx0 that fails here simply cannot enter the pool.
    pub fn validate(
        &self,
        tx: &Transaction,
        pool_id: &PoolId,
        fees: &FeeSchedule,
        height: u64,
    ) -> Result<Tx0Fee, Tx0Error> {
        let payload = self.unmask_payload(tx, pool_id)?;
        let pool_fee = fees.accepts(payload.fee_epoch, height, self.epoch_grace_blocks)?;

        let discount_percent = match payload.scode {
            0 => 0,
            scode => {
                self.scodes
                    .iter()
                    .find(|s| s.payload == scode)
                    .ok_or(Tx0Error::ScodePayload(scode))?
                    .discount_percent
            }
        };

        if discount_percent >= 100 {
            return Ok(Tx0Fee {
                payload,
                expected: 0,
                paid: 0,
                fee_vout: None,
            });
        }

        let expected = discounted(pool_fee, discount_percent);
        let address = self.fee_address(payload.fee_index)?;
        let script = address.script_pubkey();

        let (vout, output) = tx
            .output
            .iter()
            .enumerate()
            .find(|(_, output)| output.script_pubkey == script)
            .ok_or_else(|| Tx0Error::FeeOutputMissing(address.clone()))?;

        if output.value < expected {
            return Err(Tx0Error::FeeMismatch {
                expected,
                paid: output.value,
            });
        }

        Ok(Tx0Fee {
            payload,
            expected,
            paid: output.value,
            fee_vout: Some(vout as u32),
        })
    }
}

impl std::fmt::Debug for Tx0Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx0Service")
            .field("network", &self.network)
            .field("payment_code", &self.payment_code.to_string())
            .field("scodes", &self.scodes.len())
            .field("next_fee_index", &self.next_fee_index)
            .field("epoch_grace_blocks", &self.epoch_grace_blocks)
            .finish()
    }
}

/// `poolId:feeEpoch:feeIndex:feeAddress`, the address left empty when the fee is waived.
pub fn fee_output_preimage(
    pool_id: &PoolId,
    fee_epoch: u32,
    fee_index: u32,
    fee_address: Option<&Address>,
) -> String {
    format!(
        "{}:{}:{}:{}",
        pool_id,
        fee_epoch,
        fee_index,
        fee_address.map(|a| a.to_string()).unwrap_or_default()
    )
}

/// Outputs of `tx` whose value makes them eligible to enter the pool.
pub fn premix_outputs<'a>(tx: &'a Transaction, bounds: &BalanceBounds) -> Vec<(u32, &'a TxOut)> {
    tx.output
        .iter()
        .enumerate()
        .filter(|(_, output)| bounds.contains(output.value))
        .map(|(vout, output)| (vout as u32, output))
        .collect()
}

fn discounted(fee: u64, discount_percent: u8) -> u64 {
    let discount_percent = u64::from(discount_percent.min(100));
    fee * (100 - discount_percent) / 100
}

fn op_return_data(script: &Script) -> Option<&[u8]> {
    if !script.is_op_return() {
        return None;
    }
    match script.instructions().nth(1) {
        Some(Ok(Instruction::PushBytes(data))) => Some(data),
        _ => None,
    }
}
