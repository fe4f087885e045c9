//! Client Behavior Model
//!
//! Every simulated client owns its parameters, its friend list, the messages
//! waiting for its reply, and a private random stream. Once per tick it runs
//! three passes in a fixed order:
//!
//! 1. expire: drop pending messages whose reply window has closed
//! 2. reply: answer some of the remaining pending messages
//! 3. send: maybe originate a new message to a friend
//!
//! and goes idle when neither a reply nor a send was attempted.
//!
//! Reply windows: a message sent at tick `T` to a client with stale window
//! `w` arrives after the tick barrier, can be answered at ticks `T+1 ..= T+w`
//! and expires at tick `T+w+1`. With `w = 0` it therefore expires before any
//! reply pass sees it.

use crate::sam_dispatcher::{ClientProfile, Dispatcher, OutboundMessage, RegistrationHandle};
use crate::sam_error::DispatchError;
use crate::sam_graph::SocialGraph;
use crate::sam_interface::{
    derive_rng, ClientId, GroupId, MessageId, MessageKind, MessageRef, Seed, Tick, TickAction,
    TickEvent,
};
use crate::sam_scenario::{Scenario, SizeCoupling};
use log::warn;
use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-client parameters, drawn once when the client is created
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientParams {
    pub send_rate: f64,
    pub reply_rate: f64,
    pub stale_reply: Tick,
    pub message_size_range: (u32, u32),
}

fn uniform(rng: &mut StdRng, (min, max): (f64, f64)) -> f64 {
    if min < max {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

impl ClientParams {
    pub fn sample(scenario: &Scenario, rng: &mut StdRng) -> Self {
        let send_rate = uniform(rng, scenario.send_rate_range);
        let reply_rate = uniform(rng, scenario.reply_rate_range);
        let (stale_min, stale_max) = scenario.stale_reply.bounds();
        let stale_reply = rng.gen_range(stale_min..=stale_max);

        let (min_size, max_size) = scenario.message_size_range;
        let message_size_range = match scenario.size_coupling {
            SizeCoupling::Independent => (min_size, max_size),
            SizeCoupling::InverseSendRate => {
                let (min_rate, max_rate) = scenario.send_rate_range;
                let norm_rate = if max_rate > min_rate {
                    (send_rate - min_rate) / (max_rate - min_rate)
                } else {
                    0.0
                };
                let span = (max_size - min_size) as f64 * (1.0 - norm_rate);
                (min_size, min_size + span.round() as u32)
            }
        };

        Self {
            send_rate,
            reply_rate,
            stale_reply,
            message_size_range,
        }
    }
}

/// A received message waiting for this client's reply
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: MessageId,
    pub sender: ClientId,
    pub recipient: ClientId,
    pub sent_tick: Tick,
    pub size: u32,
    pub kind: MessageKind,
    /// drawn once on arrival
    pub reply_probability: f64,
    /// first tick at which the message can no longer be answered
    pub expires_at: Tick,
}

impl PendingMessage {
    fn message_ref(&self) -> MessageRef {
        MessageRef {
            id: self.id,
            peer: self.sender,
            size: self.size,
            kind: self.kind,
            sent_tick: self.sent_tick,
        }
    }
}

/// Everything a client produced during one tick
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub events: Vec<TickEvent>,
    /// sends that went through; delivered to recipients after the tick barrier
    pub outgoing: Vec<OutboundMessage>,
}

/// A simulated client
pub struct ClientState {
    id: ClientId,
    group: GroupId,
    params: ClientParams,
    friends: Vec<ClientId>,
    friend_index: Option<WeightedIndex<f64>>,
    pending: BTreeMap<MessageId, PendingMessage>,
    registration: Option<RegistrationHandle>,
    rng: StdRng,
    next_seq: u64,
}

impl ClientState {
    /// Create client `id`, drawing its parameters from its own random stream
    pub fn new(id: ClientId, scenario: &Scenario, graph: &SocialGraph, seed: &Seed) -> Self {
        let mut rng = derive_rng(seed, "client", id);
        let params = ClientParams::sample(scenario, &mut rng);

        let (friends, weights): (Vec<ClientId>, Vec<f64>) = graph
            .friends_of(id)
            .map(|f| f.iter().map(|(&c, &w)| (c, w)).unzip())
            .unwrap_or_default();

        let friend_index = if friends.is_empty() {
            None
        } else {
            // zero-weight friend lists fall back to picking uniformly
            WeightedIndex::new(&weights)
                .or_else(|_| WeightedIndex::new(vec![1.0; friends.len()]))
                .ok()
        };

        Self {
            id,
            group: graph.group_of(id).unwrap_or_default(),
            params,
            friends,
            friend_index,
            pending: BTreeMap::new(),
            registration: None,
            rng,
            next_seq: 0,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn params(&self) -> &ClientParams {
        &self.params
    }

    pub fn friends(&self) -> &[ClientId] {
        &self.friends
    }

    pub fn profile(&self, scenario: &Scenario) -> ClientProfile {
        ClientProfile {
            client: self.id,
            username: format!("{}-{:05}", scenario.name, self.id),
            group: self.group,
            infrastructure: scenario.infrastructure,
        }
    }

    pub fn set_registration(&mut self, handle: RegistrationHandle) {
        self.registration = Some(handle);
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Messages currently waiting for this client's reply, by id
    pub fn pending(&self) -> impl Iterator<Item = &PendingMessage> {
        self.pending.values()
    }

    /// Accept a message sent to this client in an earlier pass.
    ///
    /// Only called by the scheduler between ticks. The reply window uses this
    /// client's own stale value since the recipient decides when to answer.
    pub fn receive(&mut self, message: &OutboundMessage, scenario: &Scenario) {
        let reply_probability = uniform(&mut self.rng, scenario.reply_probability);
        let pending = PendingMessage {
            id: message.id,
            sender: message.from,
            recipient: self.id,
            sent_tick: message.tick,
            size: message.size,
            kind: message.kind,
            reply_probability,
            expires_at: message
                .tick
                .saturating_add(self.params.stale_reply)
                .saturating_add(1),
        };
        self.pending.insert(message.id, pending);
    }

    fn next_id(&mut self) -> MessageId {
        let id = MessageId {
            sender: self.id,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        id
    }

    async fn transmit<D: Dispatcher + ?Sized>(
        &self,
        dispatcher: &D,
        message: &OutboundMessage,
    ) -> Result<(), DispatchError> {
        match &self.registration {
            Some(handle) => dispatcher.transmit(handle, message).await,
            None => Err(DispatchError::Transmit {
                message: message.id,
                reason: format!("client {} is not registered", self.id),
            }),
        }
    }

    /// Run this client's expire, reply and send passes for `tick`
    pub async fn tick<D: Dispatcher + ?Sized>(
        &mut self,
        tick: Tick,
        scenario: &Scenario,
        dispatcher: &D,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let mut acted = false;

        // 1. expire
        let expired: Vec<MessageId> = self
            .pending
            .values()
            .filter(|p| p.expires_at <= tick)
            .map(|p| p.id)
            .collect();
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                outcome
                    .events
                    .push(TickEvent::with_message(tick, self.id, TickAction::Expire, p.message_ref()));
            }
        }

        // 2. reply
        let reply_gate = scenario.per_tick_probability(self.params.reply_rate);
        let candidates: Vec<(MessageId, f64)> = self
            .pending
            .values()
            .map(|p| (p.id, p.reply_probability))
            .collect();
        for (id, reply_probability) in candidates {
            let p = (reply_probability * reply_gate).clamp(0.0, 1.0);
            if !self.rng.gen_bool(p) {
                continue;
            }
            acted = true;

            let Some(original) = self.pending.get(&id).map(PendingMessage::message_ref) else {
                continue;
            };
            let reply = OutboundMessage {
                id: self.next_id(),
                from: self.id,
                to: original.peer,
                tick,
                size: original.size,
                kind: original.kind,
                reply_to: Some(id),
            };
            match self.transmit(dispatcher, &reply).await {
                Ok(()) => {
                    self.pending.remove(&id);
                    outcome
                        .events
                        .push(TickEvent::with_message(tick, self.id, TickAction::Reply, original));
                }
                Err(e) => {
                    // stays pending; may be answered later or expire
                    warn!("{} reply-failed: c:{} {}", tick, self.id, e);
                    outcome.events.push(TickEvent::with_message(
                        tick,
                        self.id,
                        TickAction::ReplyFailed,
                        original,
                    ));
                }
            }
        }

        // 3. send
        let send_probability = scenario.per_tick_probability(self.params.send_rate);
        if let Some(index) = &self.friend_index {
            if self.rng.gen_bool(send_probability) {
                acted = true;

                let to = self.friends[self.rng.sample(index)];
                let (min_size, max_size) = self.params.message_size_range;
                let size = self.rng.gen_range(min_size..=max_size);
                let kind = if self.rng.gen_bool(scenario.denim_probability) {
                    MessageKind::Denim
                } else {
                    MessageKind::Normal
                };
                let message = OutboundMessage {
                    id: self.next_id(),
                    from: self.id,
                    to,
                    tick,
                    size,
                    kind,
                    reply_to: None,
                };
                let message_ref = MessageRef {
                    id: message.id,
                    peer: to,
                    size,
                    kind,
                    sent_tick: tick,
                };

                match self.transmit(dispatcher, &message).await {
                    Ok(()) => {
                        outcome
                            .events
                            .push(TickEvent::with_message(tick, self.id, TickAction::Send, message_ref));
                        outcome.outgoing.push(message);
                    }
                    Err(e) => {
                        warn!("{} send-failed: c:{} {}", tick, self.id, e);
                        outcome.events.push(TickEvent::with_message(
                            tick,
                            self.id,
                            TickAction::SendFailed,
                            message_ref,
                        ));
                    }
                }
            }
        }

        // 4. idle
        if !acted {
            outcome.events.push(TickEvent::idle(tick, self.id));
        }

        outcome
    }
}
