//! # sam-scenario - Load scenarios for the sam/denim messaging infrastructure
//!
//! Registers a population of simulated clients, wires them into groups with a
//! randomized social graph, and steps them through a fixed number of logical
//! ticks in which every client sends, replies, or stays idle. The run ends
//! with an aggregate report.
//!
//! ## Core Components
//!
//! - **Scenario**: validated configuration (`sam_scenario`)
//! - **SocialGraph**: groups and Dirichlet-weighted friend edges (`sam_graph`)
//! - **ClientState**: per-client stochastic behavior and pending replies (`sam_client`)
//! - **ScenarioRunner**: the tick loop with a barrier per tick (`sam_scheduler`)
//! - **Dispatcher**: registration and transmission boundary (`sam_dispatcher`)
//! - **ReportAggregator**: statistics and reconciliation (`sam_report`)
//!
//! ```no_run
//! use sam_scenario::{LoopbackDispatcher, RunOptions, Scenario, ScenarioRunner};
//!
//! # async fn demo() -> Result<(), sam_scenario::SimError> {
//! let scenario = Scenario::load("scenarios/two_groups.yaml")?;
//! let dispatcher = LoopbackDispatcher::new(scenario.address.clone());
//! let mut runner = ScenarioRunner::new(scenario, dispatcher, RunOptions::seeded([0u8; 32]))?;
//! let report = runner.run().await?;
//! report.print_summary();
//! # Ok(())
//! # }
//! ```
//!
//! Runs are reproducible: with the same scenario and seed the report is
//! byte-identical, however the per-tick client futures get scheduled.

pub mod sam_client;
pub mod sam_dispatcher;
pub mod sam_error;
pub mod sam_graph;
pub mod sam_interface;
pub mod sam_report;
pub mod sam_scenario;
pub mod sam_scheduler;

// Re-export commonly used types
pub use sam_client::{ClientParams, ClientState, PendingMessage};
pub use sam_dispatcher::{
    ClientProfile, Dispatcher, LoopbackDispatcher, LoopbackStats, OutboundMessage,
    RegistrationHandle,
};
pub use sam_error::{ConfigError, DispatchError, SimError};
pub use sam_graph::{FriendEdge, Group, SocialGraph};
pub use sam_interface::{
    ClientId, EventSink, GroupId, LoggingEventSink, MessageId, MessageKind, NoOpSink, Seed, Tick,
    TickAction, TickEvent,
};
pub use sam_report::{
    FriendReport, FsReportWriter, MessageLog, Report, ReportAggregator, ReportWriter,
};
pub use sam_scenario::{Infrastructure, Scenario};
pub use sam_scheduler::{RunOptions, RunState, ScenarioRunner, StopHandle};
