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

//! Mixing through a shared message directory. The coordinator publishes its pools under
//! `{prefix}/pools` and reads registrations posted to `{prefix}/register/{poolId}`. Once
//! registered, a participant posts its requests to `{prefix}/mix/{mixId}` as a [`MixMessage`]
//! from the identity that registered, while output registrations go unsigned by any input to
//! `{prefix}/mix/{mixId}/output`. Answers are encrypted to the identity that posted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{
    self, ClientRequest, PoolsResponse, RegisterInputRequest, RegisterOutputRequest, ServerMessage,
};
use crate::coordinator::{Coordinator, InputOrigin};
use crate::events::MixEvent;
use crate::pool::PoolId;
use crate::Error;

/// Access to the message directory. Implementations handle their own encryption and identity.
pub trait DirectoryTransport: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), DirectoryError>;

    /// Takes the messages posted to `topic` since the previous call, each with the identity of
    /// its sender.
    fn list_with_sender(&self, topic: &str) -> Result<Vec<(String, Vec<u8>)>, DirectoryError>;

    fn send_encrypted(&self, recipient: &str, payload: &[u8]) -> Result<(), DirectoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Transport: {0}")]
    Transport(String),
    #[error("Json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A request of a registered participant, posted to its mix topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixMessage {
    /// Username the coordinator gave the input at registration.
    pub username: String,
    /// Same destinations as over STOMP: `/ws/confirmInput`, `/ws/revealOutput`, `/ws/signing`.
    pub destination: String,
    pub payload: Value,
}

pub struct DirectoryService {
    transport: Arc<dyn DirectoryTransport>,
    prefix: String,
    /// Sender identity behind each username registered through the directory.
    senders: RwLock<HashMap<String, String>>,
}

impl DirectoryService {
    pub fn new(transport: Arc<dyn DirectoryTransport>, prefix: impl Into<String>) -> Self {
        Self {
            transport,
            prefix: prefix.into(),
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a service delivering `coordinator`'s events.
    pub fn attach(transport: Arc<dyn DirectoryTransport>, coordinator: &Coordinator) -> Arc<Self> {
        let service = Arc::new(Self::new(
            transport,
            coordinator.config().directory_prefix.clone(),
        ));
        let listener = Arc::clone(&service);
        coordinator.on_event(move |event| listener.deliver(event));
        service
    }

    pub fn pools_topic(&self) -> String {
        format!("{}/pools", self.prefix)
    }

    pub fn register_topic(&self, pool_id: &PoolId) -> String {
        format!("{}/register/{}", self.prefix, pool_id)
    }

    pub fn mix_topic(&self, mix_id: &str) -> String {
        format!("{}/mix/{}", self.prefix, mix_id)
    }

    pub fn output_topic(&self, mix_id: &str) -> String {
        format!("{}/mix/{}/output", self.prefix, mix_id)
    }

    pub fn publish_pools(&self, coordinator: &Coordinator, now: Instant) -> Result<(), DirectoryError> {
        let payload = serde_json::to_vec(&PoolsResponse {
            pools: coordinator.list_pools(now),
        })?;
        self.transport.publish(&self.pools_topic(), &payload)
    }

    /// Registers everything posted to the pools' registration topics since the last poll.
    /// Refused registrations are answered with an error. Returns how many were accepted.
    pub fn poll_registrations(
        &self,
        coordinator: &Coordinator,
        now: Instant,
    ) -> Result<usize, DirectoryError> {
        let mut accepted = 0;

        for handle in coordinator.registry().pools() {
            let topic = self.register_topic(handle.id());
            for (sender, payload) in self.transport.list_with_sender(&topic)? {
                match self.register(coordinator, handle.id(), &sender, &payload, now) {
                    Ok(()) => accepted += 1,
                    Err(e) => {
                        warn!("directory registration from {} refused: {}", sender, e);
                        self.send(&sender, &ServerMessage::from(&e));
                    }
                }
            }
        }

        Ok(accepted)
    }

    /// Handles what was posted to the topics of the running mixes since the last poll.
    /// Returns how many requests were accepted.
    pub fn poll_mixes(&self, coordinator: &Coordinator, now: Instant) -> Result<usize, DirectoryError> {
        let mix_ids: Vec<String> = coordinator
            .registry()
            .pools()
            .iter()
            .filter_map(|handle| {
                let pool = handle.lock();
                (!pool.mix().is_terminal()).then(|| pool.mix().id().to_owned())
            })
            .collect();

        let mut accepted = 0;
        for mix_id in &mix_ids {
            for (sender, payload) in self.transport.list_with_sender(&self.output_topic(mix_id))? {
                let registered = serde_json::from_slice::<RegisterOutputRequest>(&payload)
                    .map_err(|e| Error::Usage(format!("invalid output registration: {}", e)))
                    .and_then(|request| api::register_output(coordinator, &request, now));
                match registered {
                    Ok(()) => accepted += 1,
                    Err(e) => {
                        warn!("directory output registration refused: {}", e);
                        self.send(&sender, &ServerMessage::from(&e));
                    }
                }
            }

            for (sender, payload) in self.transport.list_with_sender(&self.mix_topic(mix_id))? {
                match self.mix_request(coordinator, mix_id, &sender, &payload, now) {
                    Ok(None) => accepted += 1,
                    Ok(Some(reply)) => self.send(&sender, &reply),
                    Err(e) => {
                        warn!("directory request from {} refused: {}", sender, e);
                        self.send(&sender, &ServerMessage::from(&e));
                    }
                }
            }
        }

        Ok(accepted)
    }

    /// Publishes the pools, then takes pending registrations and mix requests. Returns how
    /// many were accepted.
    pub fn run_once(&self, coordinator: &Coordinator, now: Instant) -> Result<usize, DirectoryError> {
        self.publish_pools(coordinator, now)?;
        let registered = self.poll_registrations(coordinator, now)?;
        Ok(registered + self.poll_mixes(coordinator, now)?)
    }

    /// Runs a participant request, provided `sender` is who registered its username.
    fn mix_request(
        &self,
        coordinator: &Coordinator,
        mix_id: &str,
        sender: &str,
        payload: &[u8],
        now: Instant,
    ) -> Result<Option<ServerMessage>, Error> {
        let message: MixMessage = serde_json::from_slice(payload)
            .map_err(|e| Error::Usage(format!("invalid mix message: {}", e)))?;

        if self.senders.read().get(&message.username).map(String::as_str) != Some(sender) {
            return Err(Error::Usage(format!(
                "{} was not registered by this sender",
                message.username
            )));
        }

        let body = serde_json::to_vec(&message.payload)
            .map_err(|e| Error::Usage(format!("invalid payload: {}", e)))?;
        let request = ClientRequest::parse(&message.destination, &body)?;
        if request.mix_id() != Some(mix_id) {
            return Err(Error::Usage(format!(
                "{} does not belong on the topic of mix {}",
                message.destination, mix_id
            )));
        }

        Ok(api::dispatch(coordinator, &message.username, false, request, now))
    }

    fn register(
        &self,
        coordinator: &Coordinator,
        pool_id: &PoolId,
        sender: &str,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let request: RegisterInputRequest = serde_json::from_slice(payload)
            .map_err(|e| Error::Usage(format!("invalid registration: {}", e)))?;
        if request.pool_id != pool_id.as_ref() {
            return Err(Error::Usage(format!(
                "registration for {} posted to {}",
                request.pool_id, pool_id
            )));
        }

        let request = request.into_request(InputOrigin::Directory {
            sender: sender.to_owned(),
        })?;
        let username = request.username();

        // invitations may go out before register_input returns
        let previous = self
            .senders
            .write()
            .insert(username.clone(), sender.to_owned());

        match coordinator.register_input(request, now) {
            Ok(registration) => {
                debug!("{} registered {} ({:?})", sender, username, registration);
                Ok(())
            }
            Err(e) => {
                let mut senders = self.senders.write();
                match previous {
                    Some(previous) => senders.insert(username, previous),
                    None => senders.remove(&username),
                };
                Err(e)
            }
        }
    }

    fn deliver(&self, event: &MixEvent) {
        let message = ServerMessage::from_event(event);

        let recipients: Vec<String> = {
            let senders = self.senders.read();
            event
                .recipients()
                .into_iter()
                .filter_map(|username| senders.get(username).cloned())
                .collect()
        };

        if let Some(message) = &message {
            for recipient in &recipients {
                self.send(recipient, message);
            }
        }

        match event {
            MixEvent::InputEvicted { username, .. } => {
                self.senders.write().remove(username);
            }
            MixEvent::MixSuccess {
                usernames: gone, ..
            }
            | MixEvent::MixFail { dropped: gone, .. } => {
                let mut senders = self.senders.write();
                for username in gone {
                    senders.remove(username);
                }
            }
            _ => {}
        }
    }

    fn send(&self, recipient: &str, message: &ServerMessage) {
        let result = serde_json::to_vec(message)
            .map_err(DirectoryError::from)
            .and_then(|payload| self.transport.send_encrypted(recipient, &payload));

        if let Err(e) = result {
            warn!(
                "could not send {} to {}: {}",
                message.message_type(),
                recipient,
                e
            );
        }
    }

    pub fn nb_tracked(&self) -> usize {
        self.senders.read().len()
    }
}

impl std::fmt::Debug for DirectoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryService")
            .field("prefix", &self.prefix)
            .field("tracked", &self.nb_tracked())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bitcoin::consensus::encode;
    use bitcoin::{OutPoint, PackedLockTime, Transaction, TxIn};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::api::ConfirmInputRequest;
    use crate::ban::MemoryBlameStore;
    use crate::blind::StaticKeySource;
    use crate::error::code;
    use crate::events::EvictionReason;
    use crate::pool::MixStatus;
    use crate::testutil::{self, MockChain, Participant, Tx0Builder, POOL_ID};
    use crate::util::z85;

    #[derive(Default)]
    struct MemoryDirectory {
        posted: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
        published: Mutex<HashMap<String, Vec<u8>>>,
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MemoryDirectory {
        fn post(&self, topic: &str, sender: &str, payload: Vec<u8>) {
            self.posted
                .lock()
                .entry(topic.to_owned())
                .or_default()
                .push((sender.to_owned(), payload));
        }

        fn sent_to(&self, recipient: &str) -> Vec<ServerMessage> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, _)| to == recipient)
                .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
                .collect()
        }
    }

    impl DirectoryTransport for MemoryDirectory {
        fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), DirectoryError> {
            self.published
                .lock()
                .insert(topic.to_owned(), payload.to_vec());
            Ok(())
        }

        fn list_with_sender(&self, topic: &str) -> Result<Vec<(String, Vec<u8>)>, DirectoryError> {
            Ok(self.posted.lock().remove(topic).unwrap_or_default())
        }

        fn send_encrypted(&self, recipient: &str, payload: &[u8]) -> Result<(), DirectoryError> {
            self.sent
                .lock()
                .push((recipient.to_owned(), payload.to_vec()));
            Ok(())
        }
    }

    struct Fixture {
        coordinator: Coordinator,
        chain: Arc<MockChain>,
        directory: Arc<MemoryDirectory>,
        service: Arc<DirectoryService>,
        now: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            let chain = Arc::new(MockChain::default());
            let coordinator = Coordinator::new(
                testutil::coordinator_config(),
                chain.clone(),
                Box::new(MemoryBlameStore::default()),
                Box::new(StaticKeySource::new(testutil::RSA_PRIVATE_KEY)),
            )
            .unwrap();
            let directory = Arc::new(MemoryDirectory::default());
            let service = DirectoryService::attach(directory.clone(), &coordinator);

            Fixture {
                coordinator,
                chain,
                directory,
                service,
                now: Instant::now(),
            }
        }

        /// A confirmed liquidity UTXO and the registration payload for it.
        fn liquidity(&self, n: u8) -> (Participant, Vec<u8>) {
            let p = Participant::new(n, true);
            let funding = Transaction {
                version: 2,
                lock_time: PackedLockTime::ZERO,
                input: vec![TxIn::default()],
                output: vec![p.input.utxo.txout()],
            };
            self.chain.add(&funding, 10);
            let p = p.spending(
                OutPoint {
                    txid: funding.txid(),
                    vout: 0,
                },
                10,
            );

            let payload = registration(&p);
            (p, payload)
        }

        /// Fresh participants funded by one Tx0, with their registration payloads.
        fn must_mix(&self, numbers: &[u8]) -> Vec<(Participant, Vec<u8>)> {
            let quote = self
                .coordinator
                .quote_tx0(None, None)
                .unwrap()
                .into_iter()
                .find(|quote| quote.pool_id.as_ref() == POOL_ID)
                .unwrap();
            let participants: Vec<_> = numbers.iter().map(|n| Participant::new(*n, false)).collect();
            let tx0 = participants
                .iter()
                .fold(Tx0Builder::new(&quote), |builder, p| {
                    builder.premix_to(p.script_pubkey())
                })
                .build();
            self.chain.add(&tx0, 2);

            participants
                .into_iter()
                .map(|p| {
                    let vout = testutil::vout_of(&tx0, &p.script_pubkey());
                    let p = p.spending(
                        OutPoint {
                            txid: tx0.txid(),
                            vout,
                        },
                        2,
                    );
                    let payload = registration(&p);
                    (p, payload)
                })
                .collect()
        }

        fn mix_id(&self) -> String {
            self.coordinator
                .registry()
                .pool(&PoolId::from(POOL_ID))
                .unwrap()
                .lock()
                .mix()
                .id()
                .to_owned()
        }

        fn status(&self) -> MixStatus {
            self.coordinator
                .registry()
                .pool(&PoolId::from(POOL_ID))
                .unwrap()
                .lock()
                .mix()
                .status()
        }

        /// Registers three fresh inputs and two remixers through the directory, then walks
        /// them to signing the way wallets would. Returns the participants and the transaction.
        fn to_signing(&self) -> (Vec<Participant>, Transaction) {
            let mut registrations = self.must_mix(&[1, 2, 3]);
            registrations.push(self.liquidity(101));
            registrations.push(self.liquidity(102));
            for (i, (_, payload)) in registrations.iter().enumerate() {
                self.directory.post(&self.topic(), &sender(i), payload.clone());
            }
            assert_eq!(self.service.run_once(&self.coordinator, self.now).unwrap(), 5);
            assert_eq!(self.status(), MixStatus::ConfirmInput);
            let participants: Vec<_> = registrations.into_iter().map(|(p, _)| p).collect();

            let mix_id = self.mix_id();
            let mix_topic = self.service.mix_topic(&mix_id);
            let mut unblinders = Vec::new();
            for (i, p) in participants.iter().enumerate() {
                let public_key = match self.directory.sent_to(&sender(i)).as_slice() {
                    [ServerMessage::ConfirmInputMixStatusNotification { public_key_64, .. }] => {
                        z85::decode(public_key_64).unwrap()
                    }
                    other => panic!("unexpected {:?}", other),
                };
                let (blinded, unblind) = testutil::blind(&public_key, &p.bordereau());
                unblinders.push(unblind);
                let confirm = ConfirmInputRequest {
                    mix_id: mix_id.clone(),
                    blinded_bordereau_64: z85::encode(blinded),
                    user_hash: p.user_hash(),
                };
                self.directory.post(
                    &mix_topic,
                    &sender(i),
                    mix_message(p, "/ws/confirmInput", json!(confirm)),
                );
            }
            assert_eq!(self.service.run_once(&self.coordinator, self.now).unwrap(), 5);
            assert_eq!(self.status(), MixStatus::RegisterOutput);

            let mut inputs_hash = None;
            for (i, (p, unblind)) in participants.iter().zip(unblinders).enumerate() {
                let mut signed = Vec::new();
                for message in self.directory.sent_to(&sender(i)) {
                    match message {
                        ServerMessage::ConfirmInputResponse {
                            signed_bordereau_64,
                            ..
                        } => signed.push(signed_bordereau_64),
                        ServerMessage::RegisterOutputMixStatusNotification {
                            inputs_hash: hash, ..
                        } => inputs_hash = Some(hash),
                        _ => {}
                    }
                }
                assert_eq!(signed.len(), 1);

                let signature = unblind(z85::decode(&signed[0]).unwrap());
                let output = RegisterOutputRequest {
                    inputs_hash: inputs_hash.clone().unwrap(),
                    unblinded_signed_bordereau64: z85::encode(signature),
                    receive_address: p.receive.to_string(),
                    bordereau64: Some(z85::encode(p.bordereau())),
                };
                self.directory.post(
                    &self.service.output_topic(&mix_id),
                    &format!("anonymous{}", i),
                    serde_json::to_vec(&output).unwrap(),
                );
            }
            assert_eq!(self.service.run_once(&self.coordinator, self.now).unwrap(), 5);
            assert_eq!(self.status(), MixStatus::Signing);

            let tx = self
                .directory
                .sent_to(&sender(0))
                .into_iter()
                .find_map(|message| match message {
                    ServerMessage::SigningMixStatusNotification { transaction_64, .. } => {
                        Some(encode::deserialize(&z85::decode(transaction_64).unwrap()).unwrap())
                    }
                    _ => None,
                })
                .unwrap();
            (participants, tx)
        }

        fn sign(&self, i: usize, p: &Participant, tx: &Transaction) {
            let signing = json!({
                "mixId": self.mix_id(),
                "witnesses64": p.witness(tx).iter().map(z85::encode).collect::<Vec<_>>(),
            });
            self.directory.post(
                &self.service.mix_topic(&self.mix_id()),
                &sender(i),
                mix_message(p, "/ws/signing", signing),
            );
        }

        fn topic(&self) -> String {
            self.service.register_topic(&PoolId::from(POOL_ID))
        }

        fn nb_registered(&self) -> usize {
            self.coordinator
                .registry()
                .nb_registered(&PoolId::from(POOL_ID))
                .unwrap()
        }
    }

    fn sender(i: usize) -> String {
        format!("identity{}", i)
    }

    fn soroban_username(p: &Participant) -> String {
        format!("soroban:{}", p.input.outpoint())
    }

    fn registration(p: &Participant) -> Vec<u8> {
        serde_json::to_vec(&RegisterInputRequest {
            pool_id: POOL_ID.to_owned(),
            utxo_hash: p.input.outpoint().txid.to_string(),
            utxo_index: p.input.outpoint().vout,
            signature: p.sign_message(POOL_ID),
            liquidity: p.input.liquidity,
            block_height: 0,
        })
        .unwrap()
    }

    fn mix_message(p: &Participant, destination: &str, payload: Value) -> Vec<u8> {
        serde_json::to_vec(&MixMessage {
            username: soroban_username(p),
            destination: destination.to_owned(),
            payload,
        })
        .unwrap()
    }

    #[test]
    fn publishes_pools() {
        let f = Fixture::new();
        f.service.publish_pools(&f.coordinator, f.now).unwrap();

        let published = f.directory.published.lock();
        let pools: Value = serde_json::from_slice(&published["whirlpool/pools"]).unwrap();
        assert_eq!(pools["pools"][0]["poolId"], Value::from(POOL_ID));
    }

    #[test]
    fn registrations_refresh_and_errors_are_answered() {
        let f = Fixture::new();
        let (p, payload) = f.liquidity(101);

        f.directory.post(&f.topic(), "alice", payload.clone());
        f.directory.post(&f.topic(), "mallory", b"not json".to_vec());
        assert_eq!(f.service.run_once(&f.coordinator, f.now).unwrap(), 1);
        assert_eq!(f.nb_registered(), 1);
        assert_eq!(f.service.nb_tracked(), 1);

        match f.directory.sent_to("mallory").as_slice() {
            [ServerMessage::ErrorResponse { error_code, .. }] => {
                assert_eq!(*error_code, code::INVALID_ARGUMENT)
            }
            other => panic!("unexpected {:?}", other),
        }

        f.directory.post(&f.topic(), "alice", payload.clone());
        assert_eq!(f.service.poll_registrations(&f.coordinator, f.now).unwrap(), 1);
        assert_eq!(f.nb_registered(), 1);

        // the same outpoint from someone else
        f.directory.post(&f.topic(), "eve", payload);
        assert_eq!(f.service.poll_registrations(&f.coordinator, f.now).unwrap(), 0);
        assert_eq!(f.directory.sent_to("eve").len(), 1);
        assert_eq!(
            f.service.senders.read().get(&format!("soroban:{}", p.input.outpoint())),
            Some(&"alice".to_owned())
        );
    }

    #[test]
    fn wrong_topic_is_refused() {
        let f = Fixture::new();
        let (_, payload) = f.liquidity(101);

        f.directory.post("whirlpool/register/0.05btc", "alice", payload.clone());
        f.directory.post(&f.topic(), "alice", {
            let mut request: RegisterInputRequest = serde_json::from_slice(&payload).unwrap();
            request.pool_id = "0.05btc".to_owned();
            serde_json::to_vec(&request).unwrap()
        });

        assert_eq!(f.service.poll_registrations(&f.coordinator, f.now).unwrap(), 0);
        assert_eq!(f.nb_registered(), 0);
        assert_eq!(f.service.nb_tracked(), 0);
    }

    #[test]
    fn events_reach_their_sender() {
        let f = Fixture::new();
        let (p, payload) = f.liquidity(101);
        f.directory.post(&f.topic(), "alice", payload);
        f.service.poll_registrations(&f.coordinator, f.now).unwrap();
        let username = format!("soroban:{}", p.input.outpoint());

        f.service.deliver(&MixEvent::ConfirmInputInvite {
            pool_id: PoolId::from(POOL_ID),
            mix_id: "m1".to_owned(),
            username: username.clone(),
            public_key: vec![0; 4],
        });
        f.service.deliver(&MixEvent::ConfirmInputInvite {
            pool_id: PoolId::from(POOL_ID),
            mix_id: "m1".to_owned(),
            username: "user7".to_owned(),
            public_key: vec![0; 4],
        });

        let sent = f.directory.sent_to("alice");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), "ConfirmInputMixStatusNotification");
        assert_eq!(f.directory.sent.lock().len(), 1);

        f.service.deliver(&MixEvent::InputEvicted {
            pool_id: PoolId::from(POOL_ID),
            username,
            outpoint: *p.input.outpoint(),
            reason: EvictionReason::Stale,
        });
        assert_eq!(f.service.nb_tracked(), 0);
    }

    #[test]
    fn full_mix_through_the_directory() {
        let f = Fixture::new();
        let (participants, tx) = f.to_signing();
        for (i, p) in participants.iter().enumerate() {
            f.sign(i, p, &tx);
        }
        assert_eq!(f.service.run_once(&f.coordinator, f.now).unwrap(), 5);

        assert_eq!(f.status(), MixStatus::Success);
        assert_eq!(f.chain.broadcasts().len(), 1);
        assert_eq!(f.chain.broadcasts()[0].txid(), tx.txid());
        for i in 0..participants.len() {
            assert!(f
                .directory
                .sent_to(&sender(i))
                .iter()
                .any(|m| matches!(m, ServerMessage::SuccessMixStatusNotification { .. })));
        }
        // output registrations were never answered
        assert!(f.directory.sent_to("anonymous0").is_empty());
        assert_eq!(f.service.nb_tracked(), 0);
    }

    #[test]
    fn requests_only_count_from_their_registrant() {
        let f = Fixture::new();
        let (participants, tx) = f.to_signing();

        // someone else signing on behalf of the first participant
        let signing = json!({
            "mixId": f.mix_id(),
            "witnesses64": participants[0].witness(&tx).iter().map(z85::encode).collect::<Vec<_>>(),
        });
        f.directory.post(
            &f.service.mix_topic(&f.mix_id()),
            "mallory",
            mix_message(&participants[0], "/ws/signing", signing),
        );
        // a request for another mix
        f.directory.post(
            &f.service.mix_topic(&f.mix_id()),
            &sender(1),
            mix_message(
                &participants[1],
                "/ws/revealOutput",
                json!({ "mixId": "other", "receiveAddress": participants[1].receive.to_string() }),
            ),
        );
        assert_eq!(f.service.run_once(&f.coordinator, f.now).unwrap(), 0);
        assert!(matches!(
            f.directory.sent_to("mallory").as_slice(),
            [ServerMessage::ErrorResponse { .. }]
        ));
        assert!(matches!(
            f.directory.sent_to(&sender(1)).last(),
            Some(ServerMessage::ErrorResponse { .. })
        ));
        assert_eq!(f.status(), MixStatus::Signing);
    }

    #[test]
    fn banned_participants_are_forgotten() {
        let f = Fixture::new();
        let (participants, tx) = f.to_signing();
        for (i, p) in participants.iter().enumerate().skip(1) {
            f.sign(i, p, &tx);
        }
        assert_eq!(f.service.run_once(&f.coordinator, f.now).unwrap(), 4);

        let signing = Duration::from_secs(testutil::coordinator_config().timeouts.signing);
        f.coordinator.tick(f.now + signing);
        assert_eq!(f.status(), MixStatus::Fail);
        assert_eq!(f.coordinator.ledger().active_bans().len(), 1);

        // the others wait in the queue, still reachable
        assert_eq!(f.service.nb_tracked(), 4);
        assert!(!f
            .service
            .senders
            .read()
            .contains_key(&soroban_username(&participants[0])));
    }
}
