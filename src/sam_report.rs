//! Report Aggregator
//!
//! Folds the tick event stream into per-client and aggregate statistics and
//! checks the bookkeeping while doing so: every message sent is answered,
//! expired, or still pending at the end, exactly one of the three.

use crate::sam_client::{ClientParams, ClientState, PendingMessage};
use crate::sam_error::SimError;
use crate::sam_graph::SocialGraph;
use crate::sam_interface::{
    ClientId, EventSink, GroupId, MessageId, MessageKind, Seed, Tick, TickAction, TickEvent,
};
use crate::sam_scenario::Scenario;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

// ============================================================================
// Report
// ============================================================================

/// Final artifact of a scenario run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub scenario: Scenario,
    /// hex encoded top-level seed, enough to replay the run
    pub seed: String,
    pub start_tick: Tick,
    /// number of ticks that actually ran
    pub end_tick: Tick,
    /// false when the run was stopped early
    pub completed: bool,
    pub totals: Totals,
    pub message_sizes: Summary,
    pub reply_latency: Summary,
    pub clients: BTreeMap<ClientId, ClientReport>,
    pub ticks: Vec<TickMetrics>,
}

/// Aggregate counts over all clients
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub sends: u64,
    pub replies: u64,
    pub expirations: u64,
    pub pending_at_end: u64,
    pub denim_sends: u64,
    pub send_failures: u64,
    pub reply_failures: u64,
    pub idle: u64,
}

/// Per-client part of the report
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientReport {
    pub username: String,
    pub group: GroupId,
    pub params: ClientParams,
    pub friends: BTreeMap<ClientId, FriendReport>,
    pub counts: ClientCounts,
    /// sends and replies this client put on the wire, in tick order
    pub messages: Vec<MessageLog>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendReport {
    /// normalized weight
    pub frequency: f64,
    pub inter_group: bool,
}

/// A message transmitted by a client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLog {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: ClientId,
    pub to: ClientId,
    pub size: u32,
    pub tick: Tick,
    /// the answered message, for replies
    pub reply_to: Option<MessageId>,
}

/// What one client did, and what happened to the messages it sent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCounts {
    pub sends: u64,
    pub denim_sends: u64,
    pub send_failures: u64,
    /// replies this client sent
    pub replies: u64,
    pub reply_failures: u64,
    /// messages that went stale while waiting for this client
    pub expirations: u64,
    pub idle: u64,

    /// own messages that got a reply
    pub answered: u64,
    /// own messages that expired at the recipient
    pub unanswered: u64,
    /// own messages still pending when the run ended
    pub outstanding: u64,
}

/// Count, mean, variance, min and max of a series
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
    pub mean: f64,
    pub variance: f64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    #[serde(skip)]
    m2: f64,
}

impl Summary {
    /// Welford update
    pub fn add(&mut self, value: u64) {
        self.count += 1;
        let x = value as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.variance = self.m2 / self.count as f64;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

/// Activity during one tick, plus the pending backlog right after its barrier
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickMetrics {
    pub tick: Tick,
    pub sends: u64,
    pub replies: u64,
    pub expirations: u64,
    pub failures: u64,
    pub idle: u64,
    pub pending: u64,
}

impl Report {
    /// Pretty JSON; maps are ordered so identical runs serialize identically
    pub fn to_json(&self) -> Result<String, SimError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// One-screen summary for the log
    pub fn print_summary(&self) {
        let t = &self.totals;
        info!(
            "{}: {} ticks{}, sends {} (denim {}), replies {}, expired {}, pending {}, failures {}/{}",
            self.scenario.name,
            self.end_tick,
            if self.completed { "" } else { " (stopped)" },
            t.sends,
            t.denim_sends,
            t.replies,
            t.expirations,
            t.pending_at_end,
            t.send_failures,
            t.reply_failures
        );
        info!(
            "message size: mean {:.1} min {:?} max {:?}; reply latency: mean {:.2} min {:?} max {:?}",
            self.message_sizes.mean,
            self.message_sizes.min,
            self.message_sizes.max,
            self.reply_latency.mean,
            self.reply_latency.min,
            self.reply_latency.max
        );
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Event sink building the report
#[derive(Default)]
pub struct ReportAggregator {
    clients: BTreeMap<ClientId, ClientCounts>,
    sizes: Summary,
    latencies: Summary,
    ticks: BTreeMap<Tick, TickMetrics>,
    messages: BTreeMap<ClientId, Vec<MessageLog>>,
    sent: BTreeSet<MessageId>,
    resolved: BTreeSet<MessageId>,
    violations: Vec<String>,
}

impl ReportAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&mut self, client: ClientId) -> &mut ClientCounts {
        self.clients.entry(client).or_default()
    }

    fn tick_metrics(&mut self, tick: Tick) -> &mut TickMetrics {
        self.ticks.entry(tick).or_insert_with(|| TickMetrics {
            tick,
            ..TickMetrics::default()
        })
    }

    fn log_message(&mut self, event: &TickEvent, message: MessageLog) {
        self.messages.entry(event.client).or_default().push(message);
    }

    fn resolve(&mut self, event: &TickEvent, id: MessageId) {
        if !self.sent.contains(&id) {
            self.violations.push(format!(
                "tick {}: client {} resolved unknown message {}",
                event.tick, event.client, id
            ));
        }
        if !self.resolved.insert(id) {
            self.violations.push(format!(
                "tick {}: message {} resolved twice ({:?} by client {})",
                event.tick, id, event.action, event.client
            ));
        }
    }

    /// Record the pending backlog after the barrier of `tick`
    pub fn record_pending(&mut self, tick: Tick, pending: u64) {
        self.tick_metrics(tick).pending = pending;
    }

    /// Build the report and run the reconciliation check.
    ///
    /// `clients` must be the final client states; whatever is still pending
    /// there counts as outstanding for the original sender.
    pub fn finish(
        mut self,
        scenario: &Scenario,
        seed: &Seed,
        graph: &SocialGraph,
        clients: &[ClientState],
        ticks_run: Tick,
        completed: bool,
    ) -> Result<Report, SimError> {
        let leftover: Vec<&PendingMessage> = clients.iter().flat_map(|c| c.pending()).collect();
        for p in &leftover {
            if self.resolved.contains(&p.id) {
                self.violations
                    .push(format!("message {} is pending but already resolved", p.id));
            }
            if !self.sent.contains(&p.id) {
                self.violations
                    .push(format!("message {} is pending but was never sent", p.id));
            }
            self.counts(p.sender).outstanding += 1;
        }

        let mut totals = Totals::default();
        let mut per_client = BTreeMap::new();
        for client in clients {
            let counts = self.clients.get(&client.id()).cloned().unwrap_or_default();

            if counts.sends != counts.answered + counts.unanswered + counts.outstanding {
                self.violations.push(format!(
                    "client {}: sends {} != answered {} + unanswered {} + outstanding {}",
                    client.id(),
                    counts.sends,
                    counts.answered,
                    counts.unanswered,
                    counts.outstanding
                ));
            }

            totals.sends += counts.sends;
            totals.replies += counts.replies;
            totals.expirations += counts.expirations;
            totals.pending_at_end += counts.outstanding;
            totals.denim_sends += counts.denim_sends;
            totals.send_failures += counts.send_failures;
            totals.reply_failures += counts.reply_failures;
            totals.idle += counts.idle;

            per_client.insert(
                client.id(),
                ClientReport {
                    username: client.profile(scenario).username,
                    group: client.group(),
                    params: client.params().clone(),
                    friends: graph
                        .friend_frequencies(client.id())
                        .into_iter()
                        .map(|(friend, frequency)| {
                            let inter_group = graph.is_inter_group(client.id(), friend);
                            (friend, FriendReport { frequency, inter_group })
                        })
                        .collect(),
                    counts,
                    messages: self.messages.remove(&client.id()).unwrap_or_default(),
                },
            );
        }

        if self.clients.len() > clients.len() {
            self.violations.push(format!(
                "events from {} clients but only {} exist",
                self.clients.len(),
                clients.len()
            ));
        }

        if totals.sends != totals.replies + totals.expirations + totals.pending_at_end {
            self.violations.push(format!(
                "totals: sends {} != replies {} + expirations {} + pending {}",
                totals.sends, totals.replies, totals.expirations, totals.pending_at_end
            ));
        }

        if !self.violations.is_empty() {
            for v in &self.violations {
                error!("{}", v);
            }
            return Err(SimError::InternalInvariant(self.violations.join("; ")));
        }

        Ok(Report {
            scenario: scenario.clone(),
            seed: seed.iter().map(|b| format!("{:02x}", b)).collect(),
            start_tick: 0,
            end_tick: ticks_run,
            completed,
            totals,
            message_sizes: self.sizes,
            reply_latency: self.latencies,
            clients: per_client,
            ticks: self.ticks.into_values().collect(),
        })
    }
}

impl EventSink for ReportAggregator {
    fn log(&mut self, event: &TickEvent) {
        match (event.action, event.message) {
            (TickAction::Send, Some(m)) => {
                let counts = self.counts(event.client);
                counts.sends += 1;
                if m.kind == MessageKind::Denim {
                    counts.denim_sends += 1;
                }
                self.sizes.add(m.size as u64);
                self.tick_metrics(event.tick).sends += 1;
                if !self.sent.insert(m.id) {
                    self.violations.push(format!("message {} sent twice", m.id));
                }
                self.log_message(
                    event,
                    MessageLog {
                        kind: m.kind,
                        from: event.client,
                        to: m.peer,
                        size: m.size,
                        tick: event.tick,
                        reply_to: None,
                    },
                );
            }
            (TickAction::SendFailed, _) => {
                self.counts(event.client).send_failures += 1;
                self.tick_metrics(event.tick).failures += 1;
            }
            (TickAction::Reply, Some(m)) => {
                if event.tick <= m.sent_tick {
                    self.violations.push(format!(
                        "message {} sent at tick {} replied at tick {}",
                        m.id, m.sent_tick, event.tick
                    ));
                }
                self.resolve(event, m.id);
                self.counts(event.client).replies += 1;
                self.counts(m.id.sender).answered += 1;
                self.latencies.add(event.tick.saturating_sub(m.sent_tick));
                self.tick_metrics(event.tick).replies += 1;
                self.log_message(
                    event,
                    MessageLog {
                        kind: m.kind,
                        from: event.client,
                        to: m.peer,
                        size: m.size,
                        tick: event.tick,
                        reply_to: Some(m.id),
                    },
                );
            }
            (TickAction::ReplyFailed, _) => {
                self.counts(event.client).reply_failures += 1;
                self.tick_metrics(event.tick).failures += 1;
            }
            (TickAction::Expire, Some(m)) => {
                self.resolve(event, m.id);
                self.counts(event.client).expirations += 1;
                self.counts(m.id.sender).unanswered += 1;
                self.tick_metrics(event.tick).expirations += 1;
            }
            (TickAction::Idle, _) => {
                self.counts(event.client).idle += 1;
                self.tick_metrics(event.tick).idle += 1;
            }
            (action, None) => {
                self.violations.push(format!(
                    "tick {}: {:?} by client {} without a message",
                    event.tick, action, event.client
                ));
            }
        }
    }
}

// ============================================================================
// Report Writers
// ============================================================================

pub trait ReportWriter {
    fn write(&mut self, path: &str, report: &Report) -> Result<(), SimError>;
}

/// Writes reports as JSON files below a directory
pub struct FsReportWriter {
    dir: PathBuf,
}

impl FsReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for FsReportWriter {
    fn default() -> Self {
        Self::new("reports")
    }
}

impl ReportWriter for FsReportWriter {
    fn write(&mut self, path: &str, report: &Report) -> Result<(), SimError> {
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(path);
        let mut json = report.to_json()?;
        json.push('\n');
        fs::write(&target, json)?;
        info!("report written to {}", target.display());
        Ok(())
    }
}

/// Keeps the last written report in memory
#[derive(Default)]
pub struct MemoryReportWriter {
    pub last: Option<(String, Report)>,
}

impl ReportWriter for MemoryReportWriter {
    fn write(&mut self, path: &str, report: &Report) -> Result<(), SimError> {
        self.last = Some((path.to_string(), report.clone()));
        Ok(())
    }
}
