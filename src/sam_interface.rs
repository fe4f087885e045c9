use log::{debug, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;

// all ids are plain integers so they sort and hash cheaply and serialize as numbers
pub type ClientId = u32;
pub type GroupId = u32;
pub type Tick = u64;

/// Top-level random seed of a run
pub type Seed = [u8; 32];

/// Derive an independent random stream for one entity of a run.
///
/// The stream only depends on the top-level seed, the scope name and the
/// entity id, never on the order entities are processed in.
pub fn derive_rng(seed: &Seed, scope: &str, id: u32) -> StdRng {
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed);
    hasher.update(scope.as_bytes());
    hasher.update(&id.to_le_bytes());
    StdRng::from_seed(*hasher.finalize().as_bytes())
}

/// Identifies a message by its sender and the sender's send sequence number.
///
/// Ordering is (sender, seq), which is what the scheduler uses to deliver
/// messages deterministically after every tick barrier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub sender: ClientId,
    pub seq: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sender, self.seq)
    }
}

/// Traffic class of a message
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Normal,
    /// deniable cover traffic
    Denim,
}

/// What a client did during a tick
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TickAction {
    Send,
    SendFailed,
    Reply,
    ReplyFailed,
    Expire,
    Idle,
}

/// Reference to the message a tick event is about
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: MessageId,
    /// the other side of the exchange (recipient for sends, original sender for replies/expiry)
    pub peer: ClientId,
    pub size: u32,
    pub kind: MessageKind,
    /// tick at which the referenced message was originally sent
    pub sent_tick: Tick,
}

// ============================================================================
// Event Logging System
// ============================================================================

/// A single record of client activity, emitted by the behavior model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    pub tick: Tick,
    pub client: ClientId,
    pub action: TickAction,
    pub message: Option<MessageRef>,
}

impl TickEvent {
    pub fn idle(tick: Tick, client: ClientId) -> Self {
        Self {
            tick,
            client,
            action: TickAction::Idle,
            message: None,
        }
    }

    pub fn with_message(tick: Tick, client: ClientId, action: TickAction, message: MessageRef) -> Self {
        Self {
            tick,
            client,
            action,
            message: Some(message),
        }
    }

    /// Ticks between the original send and this event (replies and expiries)
    pub fn latency(&self) -> Option<Tick> {
        self.message.map(|m| self.tick.saturating_sub(m.sent_tick))
    }
}

/// Trait for consuming events produced by the scheduler
pub trait EventSink {
    fn log(&mut self, event: &TickEvent);
}

/// No-op event sink
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _event: &TickEvent) {}
}

/// Event sink that writes every event to the `log` facade
///
/// Idle events go to `trace`, everything else to `debug`.
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn log(&mut self, event: &TickEvent) {
        match (event.action, event.message) {
            (TickAction::Idle, _) => trace!("{} idle: c:{}", event.tick, event.client),
            (action, Some(m)) => debug!(
                "{} {:?}: c:{} m:{} peer:{} size:{} kind:{:?}",
                event.tick, action, event.client, m.id, m.peer, m.size, m.kind
            ),
            (action, None) => debug!("{} {:?}: c:{}", event.tick, action, event.client),
        }
    }
}

/// Fans a single event out to two sinks
pub struct TeeSink<'a, A: EventSink, B: EventSink> {
    pub first: &'a mut A,
    pub second: &'a mut B,
}

impl<A: EventSink, B: EventSink> EventSink for TeeSink<'_, A, B> {
    fn log(&mut self, event: &TickEvent) {
        self.first.log(event);
        self.second.log(event);
    }
}
