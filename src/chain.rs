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

//! Access to the Bitcoin network. The coordinator only needs a handful of reads and a way to
//! broadcast; anything able to answer them can act as a [`ChainNode`].

use std::thread;
use std::time::Duration;

use bitcoin::consensus::encode;
use bitcoin::hashes::hex::{self, FromHex};
use bitcoin::{OutPoint, Transaction, Txid};
use log::{debug, warn};

/// A transaction as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub hex: String,
    /// `0` while unconfirmed.
    pub confirmations: u32,
}

impl RawTransaction {
    pub fn decode(&self) -> Result<Transaction, ChainError> {
        let bytes = Vec::<u8>::from_hex(&self.hex)?;
        Ok(encode::deserialize(&bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("unexpected response: {0}")]
    Response(String),
    #[error("hex: {0}")]
    Hex(#[from] hex::Error),
    #[error("decode: {0}")]
    Decode(#[from] encode::Error),
}

impl ChainError {
    /// Whether asking again may give a different answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

pub trait ChainNode: Send + Sync {
    fn test_connectivity(&self) -> Result<(), ChainError>;

    /// `None` when the node does not know the transaction.
    fn raw_transaction(&self, txid: &Txid) -> Result<Option<RawTransaction>, ChainError>;

    fn is_tx_out_unspent(&self, outpoint: &OutPoint) -> Result<bool, ChainError>;

    fn block_height(&self) -> Result<u64, ChainError>;

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;
}

/// Retries the idempotent reads of `inner` on transport failures, doubling the delay every
/// attempt. Broadcasts go through exactly once.
pub struct RetryingChainNode<C> {
    inner: C,
    attempts: u32,
    base_delay: Duration,
}

impl<C: ChainNode> RetryingChainNode<C> {
    pub fn new(inner: C, attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            base_delay,
        }
    }

    fn retry<T, F: Fn(&C) -> Result<T, ChainError>>(
        &self,
        what: &str,
        read: F,
    ) -> Result<T, ChainError> {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match read(&self.inner) {
                Err(error) if error.is_transient() && attempt < self.attempts => {
                    warn!(
                        "chain {} failed (attempt {}/{}): {}",
                        what, attempt, self.attempts, error
                    );
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl<C: ChainNode> ChainNode for RetryingChainNode<C> {
    fn test_connectivity(&self) -> Result<(), ChainError> {
        self.retry("connectivity", |node| node.test_connectivity())
    }

    fn raw_transaction(&self, txid: &Txid) -> Result<Option<RawTransaction>, ChainError> {
        self.retry("getrawtransaction", |node| node.raw_transaction(txid))
    }

    fn is_tx_out_unspent(&self, outpoint: &OutPoint) -> Result<bool, ChainError> {
        self.retry("gettxout", |node| node.is_tx_out_unspent(outpoint))
    }

    fn block_height(&self) -> Result<u64, ChainError> {
        self.retry("getblockcount", |node| node.block_height())
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        debug!("broadcasting {}", tx.txid());
        self.inner.broadcast(tx)
    }
}

#[cfg(feature = "rpc")]
pub use rpc::BitcoindRpc;

#[cfg(feature = "rpc")]
mod rpc {
    use std::time::Duration;

    use bitcoin::consensus::encode;
    use bitcoin::{OutPoint, Transaction, Txid};
    use serde::de::DeserializeOwned;
    use serde::Deserialize;
    use serde_json::{json, Value};

    use super::{ChainError, ChainNode, RawTransaction};

    /// bitcoind error code for unknown transactions.
    const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

    /// A [`ChainNode`] backed by bitcoind's JSON-RPC interface.
    pub struct BitcoindRpc {
        agent: ureq::Agent,
        url: String,
        auth: String,
    }

    #[derive(Deserialize)]
    struct RpcResponse {
        result: Option<Value>,
        error: Option<RpcError>,
    }

    #[derive(Deserialize)]
    struct RpcError {
        code: i64,
        message: String,
    }

    #[derive(Deserialize)]
    struct VerboseTransaction {
        hex: String,
        #[serde(default)]
        confirmations: u32,
    }

    impl BitcoindRpc {
        pub fn new(url: &str, user: &str, password: &str, timeout: Duration) -> Self {
            let agent = ureq::builder()
                .timeout_connect(timeout)
                .timeout(timeout)
                .build();

            Self {
                agent,
                url: url.to_owned(),
                auth: format!("Basic {}", base64::encode(format!("{}:{}", user, password))),
            }
        }

        fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
            let body = json!({
                "jsonrpc": "1.0",
                "id": "whirlpool-coordinator",
                "method": method,
                "params": params,
            });

            log::debug!("RPC >>: {}", method);

            let response = match self
                .agent
                .post(&self.url)
                .set("Authorization", &self.auth)
                .send_json(body)
            {
                // bitcoind reports RPC errors with HTTP 500 and a regular body
                Ok(response) | Err(ureq::Error::Status(_, response)) => response,
                Err(ureq::Error::Transport(error)) => {
                    return Err(ChainError::Transport(error.to_string()))
                }
            };

            let response: RpcResponse = response
                .into_json()
                .map_err(|e| ChainError::Response(e.to_string()))?;

            if let Some(error) = response.error {
                return Err(ChainError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }

            serde_json::from_value(response.result.unwrap_or(Value::Null))
                .map_err(|e| ChainError::Response(e.to_string()))
        }
    }

    impl ChainNode for BitcoindRpc {
        fn test_connectivity(&self) -> Result<(), ChainError> {
            self.call::<Value>("getnetworkinfo", json!([])).map(|_| ())
        }

        fn raw_transaction(&self, txid: &Txid) -> Result<Option<RawTransaction>, ChainError> {
            match self.call::<VerboseTransaction>("getrawtransaction", json!([txid.to_string(), true])) {
                Ok(tx) => Ok(Some(RawTransaction {
                    hex: tx.hex,
                    confirmations: tx.confirmations,
                })),
                Err(ChainError::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => Ok(None),
                Err(error) => Err(error),
            }
        }

        fn is_tx_out_unspent(&self, outpoint: &OutPoint) -> Result<bool, ChainError> {
            let txout: Value = self.call(
                "gettxout",
                json!([outpoint.txid.to_string(), outpoint.vout, true]),
            )?;
            Ok(!txout.is_null())
        }

        fn block_height(&self) -> Result<u64, ChainError> {
            self.call("getblockcount", json!([]))
        }

        fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
            let txid: String = self.call("sendrawtransaction", json!([encode::serialize_hex(tx)]))?;
            txid.parse()
                .map_err(|_| ChainError::Response(format!("bad txid {}", txid)))
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn basic_auth_header() {
            let rpc = BitcoindRpc::new("http://127.0.0.1:8332", "user", "pass", Duration::from_secs(1));
            assert_eq!(rpc.auth, "Basic dXNlcjpwYXNz");
        }
    }
}
