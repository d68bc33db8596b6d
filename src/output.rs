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

//! Output registration. Outputs arrive over an identity unrelated to the inputs, so the only
//! thing tying an output to the mix is the mix key's blind signature.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use bitcoin::{Address, Network, Script};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::ban::BanLedger;
use crate::mix::Outcome;
use crate::pool::MixStatus;
use crate::registry::{PoolHandle, PoolRegistry};
use crate::Error;

/// A `registerOutput` request.
#[derive(Debug, Clone)]
pub struct OutputRegistration<'a> {
    pub inputs_hash: &'a str,
    pub unblinded_signed_bordereau: &'a [u8],
    pub receive_address: &'a str,
    /// When absent the signature is expected over the address itself.
    pub bordereau: Option<&'a [u8]>,
}

/// Tracks every address the coordinator has seen receive coins, across mixes and Tx0s.
#[derive(Debug)]
pub struct OutputService {
    network: Network,
    used: Mutex<HashSet<Script>>,
}

impl OutputService {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            used: Mutex::new(HashSet::new()),
        }
    }

    pub fn parse_address(&self, address: &str) -> Result<Address, Error> {
        let parsed = Address::from_str(address)
            .map_err(|e| Error::IllegalInput(format!("invalid address {}: {}", address, e)))?;

        if !parsed.is_valid_for_network(self.network) {
            return Err(Error::IllegalInput(format!(
                "address {} is not valid for {}",
                address, self.network
            )));
        }

        Ok(parsed)
    }

    pub fn is_used(&self, script: &Script) -> bool {
        self.used.lock().contains(script)
    }

    /// Records `scripts` as used. Returns the indices of those that already were.
    pub fn mark_used<'a, I: IntoIterator<Item = &'a Script>>(&self, scripts: I) -> Vec<usize> {
        let mut used = self.used.lock();
        scripts
            .into_iter()
            .enumerate()
            .filter_map(|(i, script)| (!used.insert(script.clone())).then(|| i))
            .collect()
    }

    /// Succeeds when `signature` is a valid unblinded signature over the address by the key of
    /// any active mix.
    pub fn check_output(
        &self,
        registry: &PoolRegistry,
        receive_address: &str,
        signature: &[u8],
    ) -> Result<(), Error> {
        self.parse_address(receive_address)?;

        let valid = registry.pools().iter().any(|handle| {
            let pool = handle.lock();
            !pool.mix().is_terminal()
                && pool.mix().signer().verify(receive_address.as_bytes(), signature)
        });

        if valid {
            Ok(())
        } else {
            Err(Error::IllegalInput("Invalid signature".to_owned()))
        }
    }

    /// Admits an output into the mix whose inputs hash matches. The address is marked used as
    /// soon as it is accepted.
    pub fn register_output(
        &self,
        registry: &PoolRegistry,
        ledger: &BanLedger,
        request: &OutputRegistration<'_>,
        now: Instant,
    ) -> Result<(Arc<PoolHandle>, Outcome), Error> {
        let address = self.parse_address(request.receive_address)?;
        let script = address.script_pubkey();
        let commitment = request
            .bordereau
            .unwrap_or_else(|| request.receive_address.as_bytes());

        for handle in registry.pools() {
            let mut pool = handle.lock();
            let mix = pool.mix();
            if mix.status() != MixStatus::RegisterOutput
                || mix.inputs_hash() != Some(request.inputs_hash)
            {
                continue;
            }

            if !mix.signer().verify(commitment, request.unblinded_signed_bordereau) {
                warn!("mix {}: output with invalid signature", mix.id());
                return Err(Error::IllegalInput("Invalid signature".to_owned()));
            }

            let mut used = self.used.lock();
            if used.contains(&script) {
                warn!("mix {}: reused output address {}", mix.id(), address);
                return Err(Error::AlreadyRegistered("Output".to_owned()));
            }

            let outcome = pool.add_output(commitment.to_vec(), script.clone(), now, ledger)?;
            used.insert(script);
            debug!("pool {}: output registered", handle.id());

            return Ok((Arc::clone(handle), outcome));
        }

        Err(Error::MixNotFound(request.inputs_hash.to_owned()))
    }
}
