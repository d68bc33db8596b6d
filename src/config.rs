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

//! Coordinator configuration. Loading the document (file, environment...) is up to the caller,
//! [`CoordinatorConfig::from_json`] only parses it.

use std::str::FromStr;
use std::time::Duration;

use bitcoin::util::bip32::{ExtendedPrivKey, ExtendedPubKey};
use bitcoin::{Network, PrivateKey};
use serde::{Deserialize, Serialize};

use crate::blind::RsaKeySource;
use crate::chain::{ChainNode, RetryingChainNode};
use crate::mix::MixTimeouts;
use crate::pool::{PoolConfig, PoolId};
use crate::tx0::{PartnerConfig, ScodeConfig, Tx0Keys, DEFAULT_EPOCH_GRACE_BLOCKS};
use crate::util::bip47::PaymentCodeKey;
use crate::Error;

/// State deadlines in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub register_input: u64,
    pub confirm_input: u64,
    pub register_output: u64,
    pub reveal_output: u64,
    pub signing: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let defaults = MixTimeouts::default();
        Self {
            register_input: defaults.register_input.as_secs(),
            confirm_input: defaults.confirm_input.as_secs(),
            register_output: defaults.register_output.as_secs(),
            reveal_output: defaults.reveal_output.as_secs(),
            signing: defaults.signing.as_secs(),
        }
    }
}

impl From<TimeoutsConfig> for MixTimeouts {
    fn from(config: TimeoutsConfig) -> Self {
        MixTimeouts {
            register_input: Duration::from_secs(config.register_input),
            confirm_input: Duration::from_secs(config.confirm_input),
            register_output: Duration::from_secs(config.register_output),
            reveal_output: Duration::from_secs(config.reveal_output),
            signing: Duration::from_secs(config.signing),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub network: Network,
    pub pools: Vec<PoolConfig>,
    pub timeouts: TimeoutsConfig,
    pub min_confirmations_must_mix: u32,
    pub min_confirmations_liquidity: u32,
    /// Per queue.
    pub max_queue_depth: usize,
    /// Seconds a directory registration stays valid without a refresh.
    pub input_liveness_timeout: u64,
    pub min_relay_fee_per_vbyte: u64,
    /// Blocks a superseded fee epoch is still honoured for Tx0s mined after the change.
    pub fee_epoch_grace_blocks: u64,
    /// Modulus size of the per-mix blind signing keys.
    pub blind_key_bits: usize,
    /// Extended public key fee addresses are derived from.
    pub fee_xpub: String,
    /// Extended private key behind the coordinator's BIP47 payment code.
    pub payment_code_xpriv: String,
    /// WIF key signing fee output pre-images.
    pub message_signing_key: String,
    pub scodes: Vec<ScodeConfig>,
    pub partners: Vec<PartnerConfig>,
    /// How often the mix driver ticks, in milliseconds.
    pub tick_interval_ms: u64,
    /// Attempts for idempotent chain reads.
    pub chain_read_attempts: u32,
    /// Delay before the first chain read retry, in milliseconds.
    pub chain_retry_delay_ms: u64,
    /// Topic prefix for the directory service.
    pub directory_prefix: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            pools: default_pools(),
            timeouts: TimeoutsConfig::default(),
            min_confirmations_must_mix: 1,
            min_confirmations_liquidity: 0,
            max_queue_depth: 1_000,
            input_liveness_timeout: 180,
            min_relay_fee_per_vbyte: 1,
            fee_epoch_grace_blocks: DEFAULT_EPOCH_GRACE_BLOCKS,
            blind_key_bits: 2048,
            fee_xpub: String::new(),
            payment_code_xpriv: String::new(),
            message_signing_key: String::new(),
            scodes: Vec::new(),
            partners: Vec::new(),
            tick_interval_ms: 1_000,
            chain_read_attempts: 3,
            chain_retry_delay_ms: 500,
            directory_prefix: "whirlpool".to_owned(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn mix_timeouts(&self) -> MixTimeouts {
        self.timeouts.into()
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.input_liveness_timeout)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Wraps `node` so reads are retried as configured.
    pub fn chain_node<C: ChainNode>(&self, node: C) -> RetryingChainNode<C> {
        RetryingChainNode::new(
            node,
            self.chain_read_attempts,
            Duration::from_millis(self.chain_retry_delay_ms),
        )
    }

    pub fn key_source(&self) -> RsaKeySource {
        RsaKeySource {
            modulus_bits: self.blind_key_bits,
        }
    }

    /// Parses the configured keys. Keys for another network are refused.
    pub fn tx0_keys(&self) -> Result<Tx0Keys, Error> {
        let fee_xpub = ExtendedPubKey::from_str(&self.fee_xpub)
            .map_err(|e| Error::Usage(format!("fee_xpub: {}", e)))?;
        let payment_code_xpriv = ExtendedPrivKey::from_str(&self.payment_code_xpriv)
            .map_err(|e| Error::Usage(format!("payment_code_xpriv: {}", e)))?;
        let message_key = PrivateKey::from_wif(&self.message_signing_key)
            .map_err(|e| Error::Usage(format!("message_signing_key: {}", e)))?;

        let mainnet = self.network == Network::Bitcoin;
        if [fee_xpub.network, payment_code_xpriv.network, message_key.network]
            .iter()
            .any(|network| (*network == Network::Bitcoin) != mainnet)
        {
            return Err(Error::Usage(format!("keys do not match {}", self.network)));
        }

        Ok(Tx0Keys {
            fee_xpub,
            payment_code: PaymentCodeKey::new(payment_code_xpriv),
            message_key,
        })
    }

    /// Checks everything that does not depend on key material.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pools.is_empty() {
            return Err(Error::Usage("no pools configured".to_owned()));
        }

        for pool in &self.pools {
            if pool.min_must_mix == 0 || pool.min_must_mix > pool.anonymity_set {
                return Err(Error::Usage(format!(
                    "pool {}: min_must_mix must be within 1..={}",
                    pool.pool_id, pool.anonymity_set
                )));
            }
            if pool.min_anonymity_set < pool.min_must_mix
                || pool.min_anonymity_set > pool.anonymity_set
            {
                return Err(Error::Usage(format!(
                    "pool {}: min_anonymity_set must be within {}..={}",
                    pool.pool_id, pool.min_must_mix, pool.anonymity_set
                )));
            }
            if pool.miner_fee_min > pool.miner_fee_cap || pool.miner_fee_cap > pool.miner_fee_max {
                return Err(Error::Usage(format!(
                    "pool {}: miner fees must satisfy min <= cap <= max",
                    pool.pool_id
                )));
            }
        }

        if self.blind_key_bits < 1024 {
            return Err(Error::Usage("blind_key_bits must be at least 1024".to_owned()));
        }

        if self.max_queue_depth == 0 {
            return Err(Error::Usage("max_queue_depth must be positive".to_owned()));
        }

        Ok(())
    }
}

/// The four denominations Whirlpool has always offered.
fn default_pools() -> Vec<PoolConfig> {
    [
        ("0.001btc", 100_000, 5_000),
        ("0.01btc", 1_000_000, 50_000),
        ("0.05btc", 5_000_000, 175_000),
        ("0.5btc", 50_000_000, 1_750_000),
    ]
    .into_iter()
    .map(|(id, denomination, fee_value)| PoolConfig {
        pool_id: PoolId::from(id),
        denomination,
        fee_value,
        miner_fee_min: 170,
        miner_fee_cap: 9_690,
        miner_fee_max: 19_125,
        anonymity_set: 5,
        min_anonymity_set: 5,
        min_must_mix: 2,
        tx0_max_outputs: 70,
    })
    .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil;

    #[test]
    fn defaults() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pools.len(), 4);
        assert_eq!(config.mix_timeouts(), MixTimeouts::default());
        assert!(config.tx0_keys().is_err());
    }

    #[test]
    fn parse_partial_document() {
        let config = CoordinatorConfig::from_json(
            r#"{
                "network": "regtest",
                "min_confirmations_must_mix": 2,
                "timeouts": { "signing": 30 },
                "scodes": [
                    { "scode": "HALF", "payload": 1, "discount_percent": 50 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.min_confirmations_must_mix, 2);
        assert_eq!(config.timeouts.signing, 30);
        assert_eq!(config.timeouts.register_input, 600);
        assert_eq!(config.scodes[0].message, None);
        assert_eq!(config.pools.len(), 4);
    }

    #[test]
    fn keys_must_match_network() {
        let config = testutil::coordinator_config();
        config.tx0_keys().unwrap();

        let mainnet = CoordinatorConfig {
            network: Network::Bitcoin,
            ..config
        };
        assert!(matches!(mainnet.tx0_keys(), Err(Error::Usage(_))));
    }

    #[test]
    fn key_source_follows_config() {
        let config = CoordinatorConfig::from_json(r#"{ "blind_key_bits": 3072 }"#).unwrap();
        assert_eq!(config.key_source().modulus_bits, 3072);
        assert_eq!(config.fee_epoch_grace_blocks, DEFAULT_EPOCH_GRACE_BLOCKS);

        let weak = CoordinatorConfig {
            blind_key_bits: 512,
            ..config
        };
        assert!(matches!(weak.validate(), Err(Error::Usage(_))));
    }

    #[test]
    fn pool_sanity() {
        let mut config = testutil::coordinator_config();
        config.pools[0].min_must_mix = 6;
        assert!(config.validate().is_err());

        let mut config = testutil::coordinator_config();
        config.pools[0].miner_fee_cap = 1;
        assert!(config.validate().is_err());
    }
}
