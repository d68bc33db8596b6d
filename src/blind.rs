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

//! Blind signatures over output commitments. Each mix signs with its own key so that a
//! signature obtained in one mix is worthless in any other.

use std::fmt;

use blind_rsa_signatures::{BlindedMessage, KeyPair, Options, SecretKey, Signature};

/// Signature options shared with the clients' blinding.
pub fn blinding_options() -> Options {
    Options::new(blind_rsa_signatures::Hash::Sha256, false, 32)
}

#[derive(Debug, thiserror::Error)]
pub enum BlindError {
    #[error("rsa: {0:?}")]
    Rsa(blind_rsa_signatures::Error),
}

impl From<blind_rsa_signatures::Error> for BlindError {
    fn from(error: blind_rsa_signatures::Error) -> Self {
        BlindError::Rsa(error)
    }
}

pub trait BlindSigner: Send + Sync + fmt::Debug {
    /// DER encoded public key, handed to participants when they are invited to confirm.
    fn public_key_der(&self) -> &[u8];

    fn blind_sign(&self, blinded: &[u8]) -> Result<Vec<u8>, BlindError>;

    /// Checks an unblinded signature over `message`.
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

/// Produces a fresh signer for every mix.
pub trait BlindKeySource: Send + Sync {
    fn generate(&self) -> Result<Box<dyn BlindSigner>, BlindError>;
}

pub struct RsaBlindSigner {
    sk: SecretKey,
    pk: blind_rsa_signatures::PublicKey,
    pk_der: Vec<u8>,
}

impl RsaBlindSigner {
    pub fn generate(modulus_bits: usize) -> Result<Self, BlindError> {
        let keys = KeyPair::generate(modulus_bits)?;
        Self::from_keys(keys.sk, keys.pk)
    }

    pub fn from_pem(pem: &str) -> Result<Self, BlindError> {
        let sk = SecretKey::from_pem(pem)?;
        let pk = sk.public_key()?;
        Self::from_keys(sk, pk)
    }

    fn from_keys(sk: SecretKey, pk: blind_rsa_signatures::PublicKey) -> Result<Self, BlindError> {
        let pk_der = pk.to_der()?;
        Ok(Self { sk, pk, pk_der })
    }
}

impl BlindSigner for RsaBlindSigner {
    fn public_key_der(&self) -> &[u8] {
        &self.pk_der
    }

    fn blind_sign(&self, blinded: &[u8]) -> Result<Vec<u8>, BlindError> {
        let signature = self
            .sk
            .blind_sign(BlindedMessage(blinded.to_vec()), &blinding_options())?;
        Ok(signature.0)
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        Signature(signature.to_vec())
            .verify(&self.pk, message, &blinding_options())
            .is_ok()
    }
}

impl fmt::Debug for RsaBlindSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaBlindSigner")
            .field("pk_der_len", &self.pk_der.len())
            .finish()
    }
}

/// Generates a new RSA key per mix.
#[derive(Debug, Clone)]
pub struct RsaKeySource {
    pub modulus_bits: usize,
}

impl Default for RsaKeySource {
    fn default() -> Self {
        Self { modulus_bits: 2048 }
    }
}

impl BlindKeySource for RsaKeySource {
    fn generate(&self) -> Result<Box<dyn BlindSigner>, BlindError> {
        Ok(Box::new(RsaBlindSigner::generate(self.modulus_bits)?))
    }
}

/// Signs every mix with the same PEM key. Meant for regtest setups and tests, where key
/// generation would dominate.
#[derive(Debug, Clone)]
pub struct StaticKeySource {
    pem: String,
}

impl StaticKeySource {
    pub fn new<S: Into<String>>(pem: S) -> Self {
        Self { pem: pem.into() }
    }
}

impl BlindKeySource for StaticKeySource {
    fn generate(&self) -> Result<Box<dyn BlindSigner>, BlindError> {
        Ok(Box::new(RsaBlindSigner::from_pem(&self.pem)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil;

    #[test]
    fn blind_sign_then_verify() {
        let signer = RsaBlindSigner::from_pem(testutil::RSA_PRIVATE_KEY).unwrap();
        let bordereau = [7_u8; 30];

        let (blinded, unblind) = testutil::blind(signer.public_key_der(), &bordereau);
        let blind_signature = signer.blind_sign(&blinded).unwrap();
        let signature = unblind(blind_signature);

        assert!(signer.verify(&bordereau, &signature));
        assert!(!signer.verify(&[8_u8; 30], &signature));
        assert!(!signer.verify(&bordereau, &[0_u8; 256]));
    }

    #[test]
    fn static_source_shares_key() {
        let source = StaticKeySource::new(testutil::RSA_PRIVATE_KEY);
        let a = source.generate().unwrap();
        let b = source.generate().unwrap();
        assert_eq!(a.public_key_der(), b.public_key_der());
    }
}
