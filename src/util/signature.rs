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

//! Bitcoin signed messages and P2WPKH witnesses, checked against the scripts they spend.

use bitcoin::blockdata::script::Script;
use bitcoin::secp256k1::{self, Message, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::util::misc::{signed_msg_hash, MessageSignature, MessageSignatureError};
use bitcoin::util::sighash::{self, SighashCache};
use bitcoin::{EcdsaSig, EcdsaSighashType, PublicKey, Transaction, TxOut};

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed message signature: {0}")]
    Message(#[from] MessageSignatureError),
    #[error("signature does not match the spent script")]
    ScriptMismatch,
    #[error("uncompressed keys cannot spend segwit scripts")]
    UncompressedKey,
    #[error("witness must hold a signature and a public key")]
    WitnessStructure,
    #[error("malformed witness signature")]
    WitnessSignature,
    #[error("witness signature must commit to all inputs and outputs")]
    SighashType,
    #[error("no input at index {0}")]
    InputIndex(usize),
    #[error("sighash: {0}")]
    Sighash(#[from] sighash::Error),
    #[error("ecdsa: {0}")]
    Ecdsa(#[from] secp256k1::Error),
}

/// Signs `message` the way wallets sign ownership proofs.
pub fn sign_message<C: Signing>(
    secp: &Secp256k1<C>,
    secret_key: &SecretKey,
    message: &str,
) -> Result<MessageSignature, SignatureError> {
    let digest = Message::from_slice(&signed_msg_hash(message)[..])?;
    let signature = secp.sign_ecdsa_recoverable(&digest, secret_key);
    Ok(MessageSignature::new(signature, true))
}

/// Recovers the key behind a base64 message signature.
pub fn recover_signer<C: Verification>(
    secp: &Secp256k1<C>,
    signature: &str,
    message: &str,
) -> Result<PublicKey, SignatureError> {
    let signature = MessageSignature::from_base64(signature)?;
    Ok(signature.recover_pubkey(secp, signed_msg_hash(message))?)
}

/// Verifies that a base64 message signature was produced by the owner of `script_pubkey`.
/// P2WPKH, P2SH-P2WPKH and P2PKH scripts are recognised.
pub fn verify_message_owner<C: Verification>(
    secp: &Secp256k1<C>,
    signature: &str,
    message: &str,
    script_pubkey: &Script,
) -> Result<(), SignatureError> {
    let signer = recover_signer(secp, signature, message)?;

    if Script::new_p2pkh(&signer.pubkey_hash()) == *script_pubkey {
        return Ok(());
    }

    let wpubkey_hash = match signer.wpubkey_hash() {
        Some(hash) => hash,
        None => return Err(SignatureError::ScriptMismatch),
    };

    let p2wpkh = Script::new_v0_p2wpkh(&wpubkey_hash);
    if p2wpkh == *script_pubkey || Script::new_p2sh(&p2wpkh.script_hash()) == *script_pubkey {
        Ok(())
    } else {
        Err(SignatureError::ScriptMismatch)
    }
}

/// Verifies the P2WPKH witness of input `index` of `tx` spending `prev_txout`. Only
/// SIGHASH_ALL signatures are accepted.
pub fn verify_p2wpkh_input<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    index: usize,
    prev_txout: &TxOut,
) -> Result<(), SignatureError> {
    let items = tx
        .input
        .get(index)
        .ok_or(SignatureError::InputIndex(index))?
        .witness
        .to_vec();

    let (signature, pubkey) = match items.as_slice() {
        [signature, pubkey] => (signature, pubkey),
        _ => return Err(SignatureError::WitnessStructure),
    };

    let signature = EcdsaSig::from_slice(signature).map_err(|_| SignatureError::WitnessSignature)?;
    if signature.hash_ty != EcdsaSighashType::All {
        return Err(SignatureError::SighashType);
    }

    let pubkey = PublicKey::from_slice(pubkey).map_err(|_| SignatureError::WitnessStructure)?;
    let wpubkey_hash = pubkey.wpubkey_hash().ok_or(SignatureError::UncompressedKey)?;
    if Script::new_v0_p2wpkh(&wpubkey_hash) != prev_txout.script_pubkey {
        return Err(SignatureError::ScriptMismatch);
    }

    let script_code = Script::new_p2pkh(&pubkey.pubkey_hash());
    let sighash = SighashCache::new(tx).segwit_signature_hash(
        index,
        &script_code,
        prev_txout.value,
        signature.hash_ty,
    )?;

    let message = Message::from_slice(&sighash[..])?;
    secp.verify_ecdsa(&message, &signature.sig, &pubkey.inner)?;

    Ok(())
}
