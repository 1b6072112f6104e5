//! # swarm-story - Scripted Discrete-Event Swarm Experiments
//!
//! Driver core for large-scale, story-scripted network experiments: a
//! declarative scenario ("story") is parsed into timestamped actions against
//! a shared simulation clock, participating nodes are partitioned across
//! cooperating simulation processes, and the run stops as soon as live
//! aggregated progress metrics say enough data has been produced.
//!
//! ## Core Components
//!
//! - **Scenario store** (`sim_story`): story parsing with variable
//!   replacement, producing an ordered action list and the reserve entries
//!   for deferred-admission participants
//! - **Partition oracle** (`sim_partition`): decides which actions this
//!   process owns in a partitioned run
//! - **Action scheduler** (`sim_schedule`): registers owned actions with the
//!   clock in stable `(fire_time, story order)` order
//! - **Reserve pool** (`sim_reserve`): deferred participants, promoted by
//!   admission actions or drained in bulk at setup
//! - **Metrics gatherer** (`sim_metrics`): periodic completion sampling and
//!   the data-driven stop decision
//!
//! ## Usage with a Simulation Kernel
//!
//! This library is kernel-agnostic. You need to:
//! 1. Implement [`sim_interface::SimulationClock`] over your event queue
//! 2. Implement [`sim_schedule::ActionSink`] for your participant lifecycle
//! 3. Parse the story, build the oracle and pool, call `schedule`, arm the
//!    gatherer, then run the kernel
//!
//! The `story_runner` binary in `driver/` wires all of this up over a
//! minimal single-process event-queue kernel.

// Core experiment modules
pub mod sim_interface;
pub mod sim_metrics;
pub mod sim_partition;
pub mod sim_report;
pub mod sim_reserve;
pub mod sim_schedule;
pub mod sim_story;

// Re-export commonly used types
pub use sim_interface::{
    repeat_every, CompletionState, NodeId, NodeRole, Participant, PartitionProvider, ProcessId,
    SimEvent, SimTime, SimulationClock, TaskHandle,
};
pub use sim_metrics::{GathererState, MetricsGatherer, ParticipantMetric, StopPolicy};
pub use sim_partition::PartitionOracle;
pub use sim_reserve::{ReserveEntry, ReservePool};
pub use sim_schedule::{schedule, ActionSink, NoOpSink};
pub use sim_story::{read_story, ActionKind, ScenarioAction, StoryError, VariableBinding};
