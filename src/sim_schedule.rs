//! Action scheduler: walks the parsed action list and registers every
//! locally-owned action with the simulation clock at its fire time.
//!
//! Ties at equal fire time preserve story order, so a run is reproducible
//! across repetitions and across partition counts. Scheduling never blocks;
//! effects execute later when the kernel reaches their fire time. An action
//! whose target is gone by then is reported and skipped, never fatal.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use log::warn;

use crate::sim_interface::{NodeId, SimulationClock};
use crate::sim_partition::PartitionOracle;
use crate::sim_story::ScenarioAction;

/// Receives action effects at their fire time.
///
/// The sink owns the participant lifecycle (node creation, churn, tracker
/// registration); the scheduler only decides when and whether to call it.
pub trait ActionSink {
    fn apply(
        &mut self,
        action: &ScenarioAction,
        clock: &mut dyn SimulationClock,
    ) -> Result<(), ApplyError>;
}

/// Sink that accepts everything and does nothing.
pub struct NoOpSink;

impl ActionSink for NoOpSink {
    fn apply(
        &mut self,
        _action: &ScenarioAction,
        _clock: &mut dyn SimulationClock,
    ) -> Result<(), ApplyError> {
        Ok(())
    }
}

/// Recoverable failures when an action effect is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The referenced node does not exist at fire time.
    UnknownTarget(NodeId),

    /// The sink refused the action for a domain reason.
    Rejected { reason: String },
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::UnknownTarget(node) => {
                write!(f, "target node {} does not exist", node)
            }
            ApplyError::Rejected { reason } => f.write_str(reason),
        }
    }
}

/// What the scheduler did with the parsed action list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    /// Actions registered with the clock.
    pub registered: usize,

    /// Actions skipped entirely because no target is locally owned.
    pub skipped_foreign: usize,
}

/// Register every locally-owned action with the clock.
///
/// Actions are ordered by `(fire_time, story_index)` before registration.
/// A multi-target action is narrowed to its locally-owned targets; if none
/// remain it is skipped. Targetless actions (notes) are always local.
pub fn schedule(
    mut actions: Vec<ScenarioAction>,
    oracle: &PartitionOracle,
    sink: Rc<RefCell<dyn ActionSink>>,
    clock: &mut dyn SimulationClock,
) -> ScheduleSummary {
    actions.sort_by_key(|a| (a.fire_time, a.story_index));

    let mut summary = ScheduleSummary::default();
    for action in actions {
        let owned: Vec<NodeId> =
            action.targets.iter().filter(|t| oracle.owns(t)).cloned().collect();
        if !action.targets.is_empty() && owned.is_empty() {
            summary.skipped_foreign += 1;
            continue;
        }

        let local = ScenarioAction {
            fire_time: action.fire_time,
            kind: action.kind,
            targets: owned,
            params: action.params,
            story_index: action.story_index,
        };
        let sink = Rc::clone(&sink);
        clock.schedule_at(
            local.fire_time,
            Box::new(move |c| {
                if let Err(err) = sink.borrow_mut().apply(&local, c) {
                    warn!(
                        "story action at {}ms (line order {}) skipped: {}",
                        local.fire_time, local.story_index, err
                    );
                }
            }),
        );
        summary.registered += 1;
    }
    summary
}
