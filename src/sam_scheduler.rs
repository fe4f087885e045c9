//! Tick Scheduler
//!
//! Drives all clients through `duration_ticks` logical ticks:
//!
//! ```text
//! Initialized -> Running(0) -> .. -> Running(n-1) -> Completed
//! ```
//!
//! Every tick fans out one future per client and joins them before doing
//! anything else. Only after that barrier are the tick's sends handed to
//! their recipients, so a message sent at tick `T` is first visible at
//! `T+1` no matter in which order the client futures made progress.

use crate::sam_client::{ClientState, TickOutcome};
use crate::sam_dispatcher::{ClientProfile, Dispatcher, OutboundMessage};
use crate::sam_error::SimError;
use crate::sam_graph::SocialGraph;
use crate::sam_interface::{ClientId, EventSink, LoggingEventSink, Seed, TeeSink, Tick};
use crate::sam_report::{Report, ReportAggregator};
use crate::sam_scenario::Scenario;
use futures::future::{join_all, try_join_all};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

/// Lifecycle of a run; there is no pause or resume
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    Running { tick: Tick },
    Completed,
}

/// Options that are not part of the scenario itself
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Random seed for reproducibility (None = generate random)
    pub seed: Option<Seed>,

    /// Sleep so that tick `n` starts `n * tickMillis` after the start
    pub pace: bool,
}

impl RunOptions {
    pub fn seeded(seed: Seed) -> Self {
        Self {
            seed: Some(seed),
            pace: false,
        }
    }

    /// Get or generate seed
    pub fn resolve_seed(&self) -> Seed {
        self.seed.unwrap_or_else(|| {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill(&mut seed);
            seed
        })
    }
}

/// Requests a running scenario to stop after its current tick
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall-clock offset of `tick` from the start of a paced run
fn tick_offset(tick: Tick, tick_millis: u64) -> Duration {
    Duration::from_millis(tick.saturating_mul(tick_millis))
}

/// Main scenario runner
pub struct ScenarioRunner<D: Dispatcher> {
    scenario: Scenario,
    seed: Seed,
    pace: bool,
    graph: SocialGraph,
    clients: Vec<ClientState>,
    dispatcher: D,
    state: RunState,
    stop: StopHandle,
}

impl<D: Dispatcher> ScenarioRunner<D> {
    /// Validate the scenario, build the social graph and create all clients
    pub fn new(scenario: Scenario, dispatcher: D, options: RunOptions) -> Result<Self, SimError> {
        scenario.validate()?;
        let seed = options.resolve_seed();
        let graph = SocialGraph::generate(&scenario, &seed)?;

        let clients = (0..scenario.clients as ClientId)
            .map(|id| ClientState::new(id, &scenario, &graph, &seed))
            .collect();

        Ok(Self {
            scenario,
            seed,
            pace: options.pace,
            graph,
            clients,
            dispatcher,
            state: RunState::Initialized,
            stop: StopHandle::default(),
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn graph(&self) -> &SocialGraph {
        &self.graph
    }

    pub fn clients(&self) -> &[ClientState] {
        &self.clients
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the scenario, logging events through the `log` facade
    pub async fn run(&mut self) -> Result<Report, SimError> {
        self.run_with_sink(&mut LoggingEventSink).await
    }

    /// Run the scenario, additionally feeding every event to `sink`
    pub async fn run_with_sink<S: EventSink>(&mut self, sink: &mut S) -> Result<Report, SimError> {
        if self.state != RunState::Initialized {
            return Err(SimError::InternalInvariant(format!(
                "scenario {} cannot start from {:?}",
                self.scenario.name, self.state
            )));
        }

        self.register_all().await?;

        let mut aggregator = ReportAggregator::new();
        let start = self.start_instant().await;
        let mut ticks_run: Tick = 0;

        for tick in 0..self.scenario.duration_ticks {
            if self.stop.is_stopped() {
                warn!("{}: stop requested before tick {}", self.scenario.name, tick);
                break;
            }
            if let Some(start) = start {
                let offset = tick_offset(tick, self.scenario.tick_millis);
                match start.checked_add(offset) {
                    Some(deadline) => sleep_until(deadline).await,
                    None => sleep(offset).await,
                }
            }

            self.state = RunState::Running { tick };
            let mut tee = TeeSink {
                first: &mut aggregator,
                second: &mut *sink,
            };
            let pending = self.step(tick, &mut tee).await?;
            aggregator.record_pending(tick, pending);
            ticks_run = tick + 1;
        }

        self.state = RunState::Completed;
        let completed = ticks_run == self.scenario.duration_ticks;

        let report = aggregator.finish(
            &self.scenario,
            &self.seed,
            &self.graph,
            &self.clients,
            ticks_run,
            completed,
        )?;
        info!(
            "{}: completed {} of {} ticks",
            self.scenario.name, ticks_run, self.scenario.duration_ticks
        );
        Ok(report)
    }

    /// Register every client; any failure aborts the run before tick 0
    async fn register_all(&mut self) -> Result<(), SimError> {
        let profiles: Vec<ClientProfile> = self
            .clients
            .iter()
            .map(|c| c.profile(&self.scenario))
            .collect();

        let handles = try_join_all(profiles.iter().map(|p| self.dispatcher.register(p)))
            .await
            .map_err(SimError::Registration)?;

        for (client, handle) in self.clients.iter_mut().zip(handles) {
            client.set_registration(handle);
        }
        info!(
            "{}: registered {} clients on {} ({:?})",
            self.scenario.name,
            self.clients.len(),
            self.scenario.address,
            self.scenario.infrastructure
        );
        Ok(())
    }

    async fn start_instant(&self) -> Option<Instant> {
        if !self.pace || self.scenario.tick_millis == 0 {
            return None;
        }
        if self.scenario.start_epoch > 0 {
            info!(
                "{}: starting in {}s",
                self.scenario.name, self.scenario.start_epoch
            );
            sleep(Duration::from_secs(self.scenario.start_epoch)).await;
        }
        Some(Instant::now())
    }

    /// One tick: fan out, join, then deliver. Returns the pending backlog.
    async fn step<S: EventSink>(&mut self, tick: Tick, sink: &mut S) -> Result<u64, SimError> {
        let scenario = &self.scenario;
        let dispatcher = &self.dispatcher;

        let outcomes: Vec<TickOutcome> = join_all(
            self.clients
                .iter_mut()
                .map(|client| client.tick(tick, scenario, dispatcher)),
        )
        .await;

        // barrier passed: events in client order, deliveries in message order
        let mut deliveries: Vec<OutboundMessage> = Vec::new();
        for outcome in outcomes {
            for event in &outcome.events {
                sink.log(event);
            }
            deliveries.extend(outcome.outgoing);
        }
        deliveries.sort_by_key(|m| m.id);

        let delivered = deliveries.len();
        for message in &deliveries {
            let recipient = self.clients.get_mut(message.to as usize).ok_or_else(|| {
                SimError::InternalInvariant(format!(
                    "tick {}: message {} addressed to unknown client {}",
                    tick, message.id, message.to
                ))
            })?;
            recipient.receive(message, &self.scenario);
        }

        let pending: u64 = self.clients.iter().map(|c| c.pending().count() as u64).sum();
        debug!(
            "{}: tick {} delivered {} messages, {} pending",
            self.scenario.name, tick, delivered, pending
        );
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam_dispatcher::{LoopbackDispatcher, RegistrationHandle};
    use crate::sam_error::DispatchError;
    use crate::sam_interface::{MessageKind, TickAction, TickEvent};
    use crate::sam_report::{MemoryReportWriter, ReportWriter};
    use crate::sam_scenario::tests::lockstep_scenario;
    use crate::sam_scenario::{GroupSpec, TickRange};

    const SEED: Seed = [7u8; 32];

    /// Collects every event
    #[derive(Default)]
    struct RecordingSink(Vec<TickEvent>);

    impl EventSink for RecordingSink {
        fn log(&mut self, event: &TickEvent) {
            self.0.push(event.clone());
        }
    }

    fn busy_scenario() -> Scenario {
        let mut scenario = lockstep_scenario();
        scenario.name = "busy".to_string();
        scenario.clients = 40;
        scenario.groups = GroupSpec::Fractions(vec![0.2, 0.3, 0.5]);
        scenario.duration_ticks = 60;
        scenario.message_size_range = (10, 500);
        scenario.denim_probability = 0.3;
        scenario.reply_probability = (0.2, 0.9);
        scenario.send_rate_range = (0.5, 3.0);
        scenario.reply_rate_range = (1.0, 4.0);
        scenario.stale_reply = TickRange::Range(0, 4);
        scenario.rate_unit_ticks = 4.0;
        scenario
    }

    async fn run(scenario: Scenario, dispatcher: LoopbackDispatcher) -> (Report, Vec<TickEvent>) {
        let mut runner = ScenarioRunner::new(scenario, dispatcher, RunOptions::seeded(SEED)).unwrap();
        let mut sink = RecordingSink::default();
        let report = runner.run_with_sink(&mut sink).await.unwrap();
        assert_eq!(runner.state(), RunState::Completed);
        (report, sink.0)
    }

    #[tokio::test]
    async fn test_lockstep_example() {
        let (report, events) = run(lockstep_scenario(), LoopbackDispatcher::new("x")).await;

        let t = &report.totals;
        assert_eq!(t.sends, 12);
        assert_eq!(t.replies, 8);
        assert_eq!(t.expirations, 0);
        assert_eq!(t.pending_at_end, 4);
        assert_eq!(t.denim_sends, 0);
        assert_eq!(t.idle, 0);
        assert!(report.completed);
        assert_eq!(report.end_tick, 3);

        for tick in 0..3 {
            let sends = events
                .iter()
                .filter(|e| e.tick == tick && e.action == TickAction::Send)
                .count();
            assert_eq!(sends, 4, "tick {}", tick);
        }
        assert_eq!(report.reply_latency.min, Some(1));
        assert_eq!(report.reply_latency.max, Some(1));
        assert_eq!(report.message_sizes.mean, 200.0);
        assert_eq!(report.ticks.iter().map(|t| t.pending).collect::<Vec<_>>(), vec![4, 4, 4]);
    }

    #[tokio::test]
    async fn test_zero_stale_window_only_expires() {
        let mut scenario = lockstep_scenario();
        scenario.stale_reply = TickRange::Fixed(0);
        let (report, _) = run(scenario, LoopbackDispatcher::new("x")).await;

        assert_eq!(report.totals.sends, 12);
        assert_eq!(report.totals.replies, 0);
        assert_eq!(report.totals.expirations, 8);
        assert_eq!(report.totals.pending_at_end, 4);
    }

    #[tokio::test]
    async fn test_full_denim_probability() {
        let mut scenario = busy_scenario();
        scenario.denim_probability = 1.0;
        let (report, events) = run(scenario, LoopbackDispatcher::new("x")).await;

        assert!(report.totals.sends > 0);
        assert_eq!(report.totals.denim_sends, report.totals.sends);
        assert!(events
            .iter()
            .filter(|e| e.action == TickAction::Send)
            .all(|e| e.message.map(|m| m.kind) == Some(MessageKind::Denim)));
    }

    #[tokio::test]
    async fn test_reconciliation_and_visibility() {
        let (report, events) = run(busy_scenario(), LoopbackDispatcher::new("x")).await;

        let t = &report.totals;
        assert!(t.sends > 0 && t.replies > 0 && t.expirations > 0);
        assert_eq!(t.sends, t.replies + t.expirations + t.pending_at_end);
        for (id, client) in &report.clients {
            let c = &client.counts;
            assert_eq!(c.sends, c.answered + c.unanswered + c.outstanding, "client {}", id);
        }

        for e in &events {
            if let (TickAction::Reply, Some(m)) = (e.action, e.message) {
                assert!(e.tick > m.sent_tick);
            }
        }

        // one event per client per tick at minimum
        let idle_or_acted = events
            .iter()
            .filter(|e| e.action != TickAction::Expire)
            .map(|e| (e.tick, e.client))
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(idle_or_acted.len(), 40 * 60);
    }

    #[tokio::test]
    async fn test_messages_resolve_once() {
        let (_, events) = run(busy_scenario(), LoopbackDispatcher::new("x")).await;

        let mut resolved = std::collections::BTreeSet::new();
        for e in &events {
            if matches!(e.action, TickAction::Reply | TickAction::Expire) {
                let id = e.message.map(|m| m.id).unwrap();
                assert!(resolved.insert(id), "{} resolved twice", id);
            }
        }
    }

    #[tokio::test]
    async fn test_runs_are_byte_identical() {
        let (a, _) = run(busy_scenario(), LoopbackDispatcher::new("x")).await;
        let (b, _) = run(busy_scenario(), LoopbackDispatcher::new("x")).await;

        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runs_are_identical_across_runtimes() {
        let (a, _) = run(busy_scenario(), LoopbackDispatcher::new("x")).await;
        let b = tokio::task::spawn(run(busy_scenario(), LoopbackDispatcher::new("x")))
            .await
            .unwrap()
            .0;

        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    /// Loopback traffic, but the lowest client ids finish their transmits last
    struct ReversingDispatcher {
        inner: LoopbackDispatcher,
        clients: u32,
    }

    #[async_trait::async_trait]
    impl Dispatcher for ReversingDispatcher {
        async fn register(
            &self,
            profile: &ClientProfile,
        ) -> Result<RegistrationHandle, DispatchError> {
            self.inner.register(profile).await
        }

        async fn transmit(
            &self,
            handle: &RegistrationHandle,
            message: &OutboundMessage,
        ) -> Result<(), DispatchError> {
            for _ in 0..self.clients.saturating_sub(message.from) * 3 {
                tokio::task::yield_now().await;
            }
            self.inner.transmit(handle, message).await
        }
    }

    #[tokio::test]
    async fn test_completion_order_does_not_change_report() {
        let (loopback, _) = run(busy_scenario(), LoopbackDispatcher::new("x")).await;

        let dispatcher = ReversingDispatcher {
            inner: LoopbackDispatcher::new("x"),
            clients: 40,
        };
        let mut runner =
            ScenarioRunner::new(busy_scenario(), dispatcher, RunOptions::seeded(SEED)).unwrap();
        let reversed = runner.run_with_sink(&mut RecordingSink::default()).await.unwrap();

        assert!(reversed.totals.sends > 0);
        assert_eq!(loopback.to_json().unwrap(), reversed.to_json().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_order_across_threads() {
        let (loopback, _) = run(busy_scenario(), LoopbackDispatcher::new("x")).await;

        let reversed = tokio::task::spawn(async {
            let dispatcher = ReversingDispatcher {
                inner: LoopbackDispatcher::new("x"),
                clients: 40,
            };
            let mut runner =
                ScenarioRunner::new(busy_scenario(), dispatcher, RunOptions::seeded(SEED)).unwrap();
            runner.run().await.unwrap()
        })
        .await
        .unwrap();

        assert_eq!(loopback.to_json().unwrap(), reversed.to_json().unwrap());
    }

    #[test]
    fn test_tick_offset_saturates() {
        assert_eq!(tick_offset(3, 100), Duration::from_millis(300));
        assert_eq!(tick_offset(3, u64::MAX), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_run_follows_tick_slots() {
        let mut scenario = lockstep_scenario();
        scenario.tick_millis = 1000;
        let options = RunOptions {
            seed: Some(SEED),
            pace: true,
        };
        let mut runner = ScenarioRunner::new(scenario, LoopbackDispatcher::new("x"), options).unwrap();

        let started = Instant::now();
        let report = runner.run().await.unwrap();
        assert!(report.completed);
        // tick 2 starts two slots after tick 0
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert!(started.elapsed() < Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_different_seeds_differ() {
        let mut runner = ScenarioRunner::new(
            busy_scenario(),
            LoopbackDispatcher::new("x"),
            RunOptions::seeded([8u8; 32]),
        )
        .unwrap();
        let other = runner.run().await.unwrap();
        let (report, _) = run(busy_scenario(), LoopbackDispatcher::new("x")).await;

        assert_ne!(report.to_json().unwrap(), other.to_json().unwrap());
    }

    #[tokio::test]
    async fn test_friendless_client_never_sends() {
        let mut scenario = lockstep_scenario();
        scenario.clients = 1;
        scenario.groups = GroupSpec::Count(1);
        let (report, events) = run(scenario, LoopbackDispatcher::new("x")).await;

        assert_eq!(report.totals.sends, 0);
        assert!(events.iter().all(|e| e.action == TickAction::Idle));
    }

    #[tokio::test]
    async fn test_transmit_failures_are_absorbed() {
        let dispatcher = LoopbackDispatcher::new("x").with_loss(0.3, [1u8; 32]);
        let (report, _) = run(busy_scenario(), dispatcher).await;

        let t = &report.totals;
        assert!(t.send_failures > 0);
        assert!(t.reply_failures > 0);
        assert_eq!(t.sends, t.replies + t.expirations + t.pending_at_end);
    }

    #[tokio::test]
    async fn test_registration_failure_aborts() {
        let dispatcher = LoopbackDispatcher::new("x").refusing(2);
        let mut runner =
            ScenarioRunner::new(lockstep_scenario(), dispatcher, RunOptions::seeded(SEED)).unwrap();
        let mut sink = RecordingSink::default();

        let result = runner.run_with_sink(&mut sink).await;
        assert!(matches!(result, Err(SimError::Registration(_))));
        assert!(sink.0.is_empty());
        assert_eq!(runner.state(), RunState::Initialized);
    }

    #[tokio::test]
    async fn test_invalid_scenario_is_config_error() {
        let mut scenario = lockstep_scenario();
        scenario.groups = GroupSpec::Fractions(vec![0.6, 0.6]);
        let result = ScenarioRunner::new(scenario, LoopbackDispatcher::new("x"), RunOptions::default());

        assert!(matches!(result, Err(SimError::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_produces_partial_report() {
        let mut runner = ScenarioRunner::new(
            busy_scenario(),
            LoopbackDispatcher::new("x"),
            RunOptions::seeded(SEED),
        )
        .unwrap();
        runner.stop_handle().stop();

        let report = runner.run().await.unwrap();
        assert!(!report.completed);
        assert_eq!(report.end_tick, 0);
        assert_eq!(report.totals.sends, 0);
    }

    /// Stops the run from inside the event stream once `tick` is seen
    struct StopAt {
        tick: Tick,
        handle: StopHandle,
    }

    impl EventSink for StopAt {
        fn log(&mut self, event: &TickEvent) {
            if event.tick == self.tick {
                self.handle.stop();
            }
        }
    }

    #[tokio::test]
    async fn test_stop_finishes_current_tick() {
        let mut runner = ScenarioRunner::new(
            busy_scenario(),
            LoopbackDispatcher::new("x"),
            RunOptions::seeded(SEED),
        )
        .unwrap();
        let mut sink = StopAt {
            tick: 9,
            handle: runner.stop_handle(),
        };

        let report = runner.run_with_sink(&mut sink).await.unwrap();
        assert!(!report.completed);
        assert_eq!(report.end_tick, 10);
        assert_eq!(report.ticks.len(), 10);
        let t = &report.totals;
        assert_eq!(t.sends, t.replies + t.expirations + t.pending_at_end);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let mut runner = ScenarioRunner::new(
            lockstep_scenario(),
            LoopbackDispatcher::new("x"),
            RunOptions::seeded(SEED),
        )
        .unwrap();
        runner.run().await.unwrap();

        assert!(matches!(runner.run().await, Err(SimError::InternalInvariant(_))));
    }

    #[tokio::test]
    async fn test_report_is_written() {
        let (report, _) = run(lockstep_scenario(), LoopbackDispatcher::new("x")).await;
        let mut writer = MemoryReportWriter::default();
        writer.write(&report.scenario.report_path(), &report).unwrap();

        let (path, written) = writer.last.unwrap();
        assert_eq!(path, "lockstep.json");
        assert_eq!(written.totals, report.totals);
    }

    #[tokio::test]
    async fn test_every_client_registered() {
        let mut runner = ScenarioRunner::new(
            busy_scenario(),
            LoopbackDispatcher::new("x"),
            RunOptions::seeded(SEED),
        )
        .unwrap();
        runner.run().await.unwrap();

        assert!(runner.clients().iter().all(|c| c.is_registered()));
        assert_eq!(runner.dispatcher().stats().registered, 40);
    }
}
