//! Dispatcher / Registration Adapter
//!
//! Boundary between the simulation and the messaging infrastructure. The
//! engine only needs two operations from it: register a client before the run
//! starts and transmit a message during a tick. Both may suspend on I/O.

use crate::sam_error::DispatchError;
use crate::sam_interface::{ClientId, GroupId, MessageId, MessageKind, Seed, Tick};
use crate::sam_scenario::Infrastructure;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// What the infrastructure learns about a client when it registers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub client: ClientId,
    pub username: String,
    pub group: GroupId,
    pub infrastructure: Infrastructure,
}

/// Proof of registration, needed for every transmit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationHandle {
    pub client: ClientId,
    pub account: String,
}

/// A message handed to the infrastructure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: MessageId,
    pub from: ClientId,
    pub to: ClientId,
    pub tick: Tick,
    pub size: u32,
    pub kind: MessageKind,
    /// set when this message answers an earlier one
    pub reply_to: Option<MessageId>,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn register(&self, profile: &ClientProfile) -> Result<RegistrationHandle, DispatchError>;

    async fn transmit(
        &self,
        handle: &RegistrationHandle,
        message: &OutboundMessage,
    ) -> Result<(), DispatchError>;
}

// ============================================================================
// Loopback Dispatcher
// ============================================================================

/// In-process dispatcher that accepts traffic without touching the network.
///
/// Optionally drops a fraction of transmits and refuses registration for
/// chosen clients, to exercise the failure paths. Which messages get dropped
/// depends only on the loss seed and the message id, so runs stay
/// reproducible however the clients are scheduled.
pub struct LoopbackDispatcher {
    address: String,
    loss_fraction: f64,
    loss_seed: Seed,
    refused: BTreeSet<ClientId>,

    registered: AtomicU64,
    transmitted: AtomicU64,
    dropped: AtomicU64,
    bytes: AtomicU64,
}

/// Traffic seen by a `LoopbackDispatcher`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub registered: u64,
    pub transmitted: u64,
    pub dropped: u64,
    pub bytes: u64,
}

impl LoopbackDispatcher {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            loss_fraction: 0.0,
            loss_seed: [0u8; 32],
            refused: BTreeSet::new(),
            registered: AtomicU64::new(0),
            transmitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Fail roughly `fraction` of all transmits
    pub fn with_loss(mut self, fraction: f64, seed: Seed) -> Self {
        self.loss_fraction = fraction.clamp(0.0, 1.0);
        self.loss_seed = seed;
        self
    }

    /// Refuse to register `client`
    pub fn refusing(mut self, client: ClientId) -> Self {
        self.refused.insert(client);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            registered: self.registered.load(Ordering::Relaxed),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    fn is_lost(&self, id: &MessageId) -> bool {
        if self.loss_fraction <= 0.0 {
            return false;
        }
        if self.loss_fraction >= 1.0 {
            return true;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.loss_seed);
        hasher.update(&id.sender.to_le_bytes());
        hasher.update(&id.seq.to_le_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
        let draw = u64::from_le_bytes(word) as f64 / u64::MAX as f64;
        draw < self.loss_fraction
    }
}

#[async_trait]
impl Dispatcher for LoopbackDispatcher {
    async fn register(&self, profile: &ClientProfile) -> Result<RegistrationHandle, DispatchError> {
        if self.refused.contains(&profile.client) {
            return Err(DispatchError::Registration {
                client: profile.client,
                reason: format!("{} refused registration", self.address),
            });
        }
        let n = self.registered.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("registered {} on {} ({})", profile.username, self.address, n);
        Ok(RegistrationHandle {
            client: profile.client,
            account: format!("{:?}:{}", profile.infrastructure, profile.username).to_lowercase(),
        })
    }

    async fn transmit(
        &self,
        handle: &RegistrationHandle,
        message: &OutboundMessage,
    ) -> Result<(), DispatchError> {
        if handle.client != message.from {
            return Err(DispatchError::Transmit {
                message: message.id,
                reason: format!("handle of {} used by {}", handle.client, message.from),
            });
        }
        if self.is_lost(&message.id) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::Transmit {
                message: message.id,
                reason: "lost".to_string(),
            });
        }
        self.transmitted.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(message.size as u64, Ordering::Relaxed);
        Ok(())
    }
}
