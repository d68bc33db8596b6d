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

//! Wire payloads of the Whirlpool protocol and the REST endpoints built on them. Field names
//! are the ones clients send and expect; binary fields travel Z85 encoded.

use std::str::FromStr;
use std::time::Instant;

use bitcoin::consensus::encode;
use bitcoin::hashes::hex::ToHex;
use bitcoin::{Network, OutPoint, Txid};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::coordinator::{Coordinator, InputOrigin, InputRequest};
use crate::error::ErrorKind;
use crate::events::MixEvent;
use crate::output::OutputRegistration;
use crate::pool::PoolId;
use crate::registry::PoolSummary;
use crate::tx0::Tx0Data;
use crate::util::z85;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInputRequest {
    pub pool_id: String,
    pub utxo_hash: String,
    pub utxo_index: u32,
    pub signature: String,
    pub liquidity: bool,
    #[serde(default)]
    pub block_height: u32,
}

impl RegisterInputRequest {
    pub fn into_request(self, origin: InputOrigin) -> Result<InputRequest, Error> {
        let txid = Txid::from_str(&self.utxo_hash)
            .map_err(|_| Error::Usage(format!("invalid utxoHash: {}", self.utxo_hash)))?;

        Ok(InputRequest {
            pool_id: PoolId::from(self.pool_id),
            outpoint: OutPoint {
                txid,
                vout: self.utxo_index,
            },
            signature: self.signature,
            liquidity: self.liquidity,
            origin,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmInputRequest {
    pub mix_id: String,
    pub blinded_bordereau_64: String,
    pub user_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequest {
    pub mix_id: String,
    pub witnesses_64: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealOutputRequest {
    pub mix_id: String,
    pub receive_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutputRequest {
    pub receive_address: String,
    /// Z85 unblinded signature over the address.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOutputRequest {
    pub inputs_hash: String,
    pub unblinded_signed_bordereau64: String,
    pub receive_address: String,
    #[serde(default)]
    pub bordereau64: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx0DataRequest {
    #[serde(default)]
    pub scode: Option<String>,
    #[serde(default)]
    pub partner_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTx0Request {
    pub tx64: String,
    pub pool_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolsResponse {
    pub pools: Vec<PoolSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx0DataResponse {
    pub tx0_datas: Vec<Tx0Data>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PushTx0Response {
    Ok {
        txid: String,
    },
    Error {
        message: String,
        #[serde(rename = "pushTxErrorCode")]
        push_tx_error_code: Option<String>,
        #[serde(rename = "voutsAddressReuse")]
        vouts_address_reuse: Option<Vec<u32>>,
    },
}

impl From<&Error> for PushTx0Response {
    fn from(error: &Error) -> Self {
        match error {
            Error::PushTx(e) => PushTx0Response::Error {
                message: e.message.clone(),
                push_tx_error_code: e.push_tx_error_code.clone(),
                vouts_address_reuse: (!e.vouts_address_reuse.is_empty())
                    .then(|| e.vouts_address_reuse.clone()),
            },
            e => PushTx0Response::Error {
                message: e.to_string(),
                push_tx_error_code: None,
                vouts_address_reuse: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePoolResponse {
    pub network_id: String,
    pub denomination: u64,
    pub must_mix_balance_min: u64,
    pub must_mix_balance_cap: u64,
    pub must_mix_balance_max: u64,
}

impl SubscribePoolResponse {
    pub fn new(coordinator: &Coordinator, pool_id: &PoolId) -> Result<Self, Error> {
        let handle = coordinator.registry().pool(pool_id)?;
        let pool = handle.lock();
        let bounds = pool.bounds();

        Ok(Self {
            network_id: network_id(coordinator.config().network).to_owned(),
            denomination: pool.denomination(),
            must_mix_balance_min: bounds.min,
            must_mix_balance_cap: bounds.cap,
            must_mix_balance_max: bounds.max,
        })
    }
}

fn network_id(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "main",
        Network::Regtest => "regtest",
        _ => "test",
    }
}

/// A message to one participant. Serialized with its type name under `type`; over STOMP the
/// same name goes into the `messageType` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ConfirmInputMixStatusNotification { mix_id: String, public_key_64: String },
    #[serde(rename_all = "camelCase")]
    ConfirmInputResponse {
        mix_id: String,
        signed_bordereau_64: String,
    },
    #[serde(rename_all = "camelCase")]
    RegisterOutputMixStatusNotification { mix_id: String, inputs_hash: String },
    #[serde(rename_all = "camelCase")]
    RevealOutputMixStatusNotification { mix_id: String },
    #[serde(rename_all = "camelCase")]
    SigningMixStatusNotification { mix_id: String, transaction_64: String },
    #[serde(rename_all = "camelCase")]
    SuccessMixStatusNotification { mix_id: String },
    #[serde(rename_all = "camelCase")]
    FailMixStatusNotification { mix_id: String },
    #[serde(rename_all = "camelCase")]
    ErrorResponse { error_code: u32, message: String },
}

impl ServerMessage {
    /// What the recipients of `event` are told. Events meant for operators only map to
    /// `None`.
    pub fn from_event(event: &MixEvent) -> Option<Self> {
        Some(match event {
            MixEvent::ConfirmInputInvite {
                mix_id, public_key, ..
            } => ServerMessage::ConfirmInputMixStatusNotification {
                mix_id: mix_id.clone(),
                public_key_64: z85::encode(public_key),
            },
            MixEvent::InputConfirmed {
                mix_id,
                signed_bordereau,
                ..
            } => ServerMessage::ConfirmInputResponse {
                mix_id: mix_id.clone(),
                signed_bordereau_64: z85::encode(signed_bordereau),
            },
            MixEvent::RegisterOutputInvite {
                mix_id,
                inputs_hash,
                ..
            } => ServerMessage::RegisterOutputMixStatusNotification {
                mix_id: mix_id.clone(),
                inputs_hash: inputs_hash.clone(),
            },
            MixEvent::RevealOutputInvite { mix_id, .. } => {
                ServerMessage::RevealOutputMixStatusNotification {
                    mix_id: mix_id.clone(),
                }
            }
            MixEvent::SigningInvite {
                mix_id,
                transaction,
                ..
            } => ServerMessage::SigningMixStatusNotification {
                mix_id: mix_id.clone(),
                transaction_64: z85::encode(encode::serialize(transaction)),
            },
            MixEvent::MixSuccess { mix_id, .. } => ServerMessage::SuccessMixStatusNotification {
                mix_id: mix_id.clone(),
            },
            MixEvent::MixFail { mix_id, .. } => ServerMessage::FailMixStatusNotification {
                mix_id: mix_id.clone(),
            },
            MixEvent::MixStarted { .. } | MixEvent::InputEvicted { .. } => return None,
        })
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::ConfirmInputMixStatusNotification { .. } => {
                "ConfirmInputMixStatusNotification"
            }
            ServerMessage::ConfirmInputResponse { .. } => "ConfirmInputResponse",
            ServerMessage::RegisterOutputMixStatusNotification { .. } => {
                "RegisterOutputMixStatusNotification"
            }
            ServerMessage::RevealOutputMixStatusNotification { .. } => {
                "RevealOutputMixStatusNotification"
            }
            ServerMessage::SigningMixStatusNotification { .. } => "SigningMixStatusNotification",
            ServerMessage::SuccessMixStatusNotification { .. } => "SuccessMixStatusNotification",
            ServerMessage::FailMixStatusNotification { .. } => "FailMixStatusNotification",
            ServerMessage::ErrorResponse { .. } => "ErrorResponse",
        }
    }
}

impl From<&Error> for ServerMessage {
    fn from(error: &Error) -> Self {
        ServerMessage::ErrorResponse {
            error_code: error.code(),
            message: error.to_string(),
        }
    }
}

/// A request sent over a participant's mixing connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    RegisterInput(RegisterInputRequest),
    ConfirmInput(ConfirmInputRequest),
    RevealOutput(RevealOutputRequest),
    Signing(SigningRequest),
}

impl ClientRequest {
    /// Parses the body sent to a STOMP `destination`.
    pub fn parse(destination: &str, body: &[u8]) -> Result<Self, Error> {
        let json = |e: serde_json::Error| Error::Usage(format!("{}: {}", destination, e));
        Ok(match destination {
            "/ws/registerInput" => {
                ClientRequest::RegisterInput(serde_json::from_slice(body).map_err(json)?)
            }
            "/ws/confirmInput" => {
                ClientRequest::ConfirmInput(serde_json::from_slice(body).map_err(json)?)
            }
            "/ws/revealOutput" => {
                ClientRequest::RevealOutput(serde_json::from_slice(body).map_err(json)?)
            }
            "/ws/signing" => ClientRequest::Signing(serde_json::from_slice(body).map_err(json)?),
            other => return Err(Error::Usage(format!("unknown destination {}", other))),
        })
    }
}

impl ClientRequest {
    /// The mix a request is about. Registrations come before any mix.
    pub fn mix_id(&self) -> Option<&str> {
        match self {
            ClientRequest::RegisterInput(_) => None,
            ClientRequest::ConfirmInput(request) => Some(&request.mix_id),
            ClientRequest::RevealOutput(request) => Some(&request.mix_id),
            ClientRequest::Signing(request) => Some(&request.mix_id),
        }
    }
}

/// Runs `request` for the participant connected as `username`. Only refusals are answered
/// directly; everything else, the signed bordereau included, reaches the participant as events.
pub fn dispatch(
    coordinator: &Coordinator,
    username: &str,
    over_tor: bool,
    request: ClientRequest,
    now: Instant,
) -> Option<ServerMessage> {
    let origin = InputOrigin::Direct {
        username: username.to_owned(),
        over_tor,
    };

    let result = match request {
        ClientRequest::RegisterInput(request) => request
            .into_request(origin)
            .and_then(|request| coordinator.register_input(request, now))
            .map(|_| None),
        ClientRequest::ConfirmInput(request) => decode(&request.blinded_bordereau_64)
            .and_then(|blinded| {
                coordinator.confirm_input(
                    &request.mix_id,
                    username,
                    &blinded,
                    &request.user_hash,
                    now,
                )
            })
            .map(|_| None),
        ClientRequest::RevealOutput(request) => coordinator
            .reveal_output(&request.mix_id, username, &request.receive_address, now)
            .map(|_| None),
        ClientRequest::Signing(request) => request
            .witnesses_64
            .iter()
            .map(|item| decode(item))
            .collect::<Result<Vec<_>, _>>()
            .and_then(|witness| coordinator.sign(&request.mix_id, username, witness, now))
            .map(|_| None),
    };

    match result {
        Ok(reply) => reply,
        Err(e) => {
            debug!("request from {} refused: {}", username, e);
            Some(ServerMessage::from(&e))
        }
    }
}

/// Output registrations carry no username, they must not be linkable to an input.
pub fn register_output(
    coordinator: &Coordinator,
    request: &RegisterOutputRequest,
    now: Instant,
) -> Result<(), Error> {
    let signature = decode(&request.unblinded_signed_bordereau64)?;
    let bordereau = request.bordereau64.as_deref().map(decode).transpose()?;
    coordinator.register_output(
        &OutputRegistration {
            inputs_hash: &request.inputs_hash,
            unblinded_signed_bordereau: &signature,
            receive_address: &request.receive_address,
            bordereau: bordereau.as_deref(),
        },
        now,
    )
}

fn decode(value: &str) -> Result<Vec<u8>, Error> {
    z85::decode(value).ok_or_else(|| Error::Usage("invalid Z85 payload".to_owned()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
}

/// Answer to a REST call: an HTTP status and a JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Response { status, body },
            Err(e) => {
                error!("response serialization: {}", e);
                Response {
                    status: 500,
                    body: Vec::new(),
                }
            }
        }
    }

    fn error(error: &Error) -> Self {
        let status = match error.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Infrastructure | ErrorKind::Internal => 500,
            _ => 400,
        };
        Response::json(status, &ServerMessage::from(error))
    }
}

/// The REST endpoints: `/rest/pools`, `/rest/tx0/v1`, `/rest/tx0/push`, `/rest/checkOutput`
/// and `/rest/registerOutput`.
pub fn handle_rest(
    coordinator: &Coordinator,
    method: Method,
    path: &str,
    body: &[u8],
    now: Instant,
) -> Response {
    debug!("REST {:?} {}", method, path);

    match (method, path) {
        (Method::GET, "/rest/pools") => Response::json(
            200,
            &PoolsResponse {
                pools: coordinator.list_pools(now),
            },
        ),
        (Method::POST, "/rest/tx0/v1") => {
            let request: Tx0DataRequest = match parse(body) {
                Ok(request) => request,
                Err(e) => return Response::error(&e),
            };
            match coordinator.quote_tx0(request.scode.as_deref(), request.partner_id.as_deref()) {
                Ok(tx0_datas) => Response::json(200, &Tx0DataResponse { tx0_datas }),
                Err(e) => Response::error(&e),
            }
        }
        (Method::POST, "/rest/tx0/push") => {
            let pushed = parse::<PushTx0Request>(body).and_then(|request| {
                let tx = decode(&request.tx64)?;
                coordinator.push_tx0(&tx.to_hex(), &PoolId::from(request.pool_id))
            });
            match pushed {
                Ok(txid) => Response::json(
                    200,
                    &PushTx0Response::Ok {
                        txid: txid.to_string(),
                    },
                ),
                Err(e) => Response::json(400, &PushTx0Response::from(&e)),
            }
        }
        (Method::POST, "/rest/checkOutput") => {
            let checked = parse::<CheckOutputRequest>(body).and_then(|request| {
                let signature = decode(&request.signature)?;
                coordinator.check_output(&request.receive_address, &signature)
            });
            match checked {
                Ok(()) => Response::json(200, &serde_json::json!({})),
                Err(e) => Response::error(&e),
            }
        }
        (Method::POST, "/rest/registerOutput") => {
            let registered = parse::<RegisterOutputRequest>(body)
                .and_then(|request| register_output(coordinator, &request, now));
            match registered {
                Ok(()) => Response::json(200, &serde_json::json!({})),
                Err(e) => Response::error(&e),
            }
        }
        _ => Response::error(&Error::Usage(format!("no route for {:?} {}", method, path))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::Usage(format!("invalid request: {}", e)))
}
