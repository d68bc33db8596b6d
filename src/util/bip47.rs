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

//! The subset of BIP47 the coordinator needs: its own payment code, the notification key
//! behind it, and the shared blinding factor used to mask Tx0 fee payloads.

use std::fmt;

use bitcoin::hashes::{hmac, sha512, Hash, HashEngine};
use bitcoin::secp256k1::{self, Scalar, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::util::base58;
use bitcoin::util::bip32::{self, ChainCode, ChildNumber, ExtendedPrivKey, ExtendedPubKey};
use bitcoin::OutPoint;

const PAYMENT_CODE_BIN_LENGTH: usize = 80;
const LETTER_P: u8 = 0x47;
const VERSION_1: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCode(pub ExtendedPubKey);

impl PaymentCode {
    pub fn try_from_str(value: &str) -> Result<Self, Error> {
        let payment_code = base58::from_check(value)?;

        if payment_code.first() != Some(&LETTER_P) {
            return Err(Error::Format("Incorrect version bytes"));
        }

        PaymentCode::try_from_bytes(&payment_code[1..])
    }

    fn try_from_bytes(payment_code: &[u8]) -> Result<Self, Error> {
        if payment_code.len() != PAYMENT_CODE_BIN_LENGTH {
            return Err(Error::Format("Incorrect binary length"));
        }

        let public_key = secp256k1::PublicKey::from_slice(&payment_code[2..35])?;
        let chain_code = ChainCode::from(&payment_code[35..67]);

        Ok(Self(ExtendedPubKey {
            network: bitcoin::Network::Bitcoin,
            depth: 3,
            parent_fingerprint: bip32::Fingerprint::default(),
            child_number: ChildNumber::Normal { index: 0 },
            public_key,
            chain_code,
        }))
    }

    /// Binary form: version, features, compressed key, chain code, zeroed reserved bytes.
    pub fn to_bytes(&self) -> [u8; PAYMENT_CODE_BIN_LENGTH] {
        let mut bytes = [0_u8; PAYMENT_CODE_BIN_LENGTH];
        bytes[0] = VERSION_1;
        bytes[2..35].copy_from_slice(&self.0.public_key.serialize());
        bytes[35..67].copy_from_slice(&self.0.chain_code[..]);
        bytes
    }

    pub fn notification_pubkey<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
    ) -> Result<secp256k1::PublicKey, Error> {
        let child = self.0.ckd_pub(secp, ChildNumber::from_normal_idx(0)?)?;
        Ok(child.public_key)
    }
}

impl fmt::Display for PaymentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut data = Vec::with_capacity(PAYMENT_CODE_BIN_LENGTH + 1);
        data.push(LETTER_P);
        data.extend_from_slice(&self.to_bytes());
        f.write_str(&base58::check_encode_slice(&data))
    }
}

/// The private side of the coordinator's payment code.
#[derive(Debug, Clone)]
pub struct PaymentCodeKey(ExtendedPrivKey);

impl PaymentCodeKey {
    pub fn new(xpriv: ExtendedPrivKey) -> Self {
        Self(xpriv)
    }

    pub fn payment_code<C: Signing>(&self, secp: &Secp256k1<C>) -> PaymentCode {
        PaymentCode(ExtendedPubKey::from_priv(secp, &self.0))
    }

    /// Secret key matching [`PaymentCode::notification_pubkey`].
    pub fn notification_secret<C: Signing>(&self, secp: &Secp256k1<C>) -> Result<SecretKey, Error> {
        let child = self.0.ckd_priv(secp, ChildNumber::from_normal_idx(0)?)?;
        Ok(child.private_key)
    }
}

/// HMAC-SHA512 keyed by the serialized outpoint over the x coordinate of the ECDH point shared
/// by `sk` and `pk`. Either side of the exchange obtains the same factor.
pub fn blinding_factor(
    sk: &SecretKey,
    pk: &secp256k1::PublicKey,
    utxo: &OutPoint,
) -> Result<[u8; 64], secp256k1::Error> {
    let shared = pk.mul_tweak(&Secp256k1::verification_only(), &Scalar::from(*sk))?;

    let mut encoded_utxo = Vec::with_capacity(36);
    encoded_utxo.extend_from_slice(&utxo.txid.as_hash().into_inner());
    encoded_utxo.extend_from_slice(&utxo.vout.to_le_bytes());

    let mut engine = hmac::HmacEngine::<sha512::Hash>::new(&encoded_utxo);
    engine.input(&shared.serialize()[1..]);

    Ok(hmac::Hmac::<sha512::Hash>::from_engine(engine).into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Format: {0}")]
    Format(&'static str),
    #[error("Base58: {0}")]
    Base58(#[from] base58::Error),
    #[error("BIP32: {0}")]
    Bip32(#[from] bip32::Error),
    #[error("Ecdsa: {0}")]
    Ecdsa(#[from] secp256k1::Error),
}
