// Synthetic swarm participants for the story runner.
//
// Stands in for the real P2P protocol: a joined client "downloads" for a
// seeded-random duration and then reports completion. Deterministic for a
// fixed seed, which keeps whole runs reproducible.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::info;
use rand::rngs::StdRng;
use rand::Rng;

use swarm_story::sim_interface::{
    CompletionState, NodeId, NodeRole, Participant, SimTime, SimulationClock,
};
use swarm_story::sim_metrics::MetricsGatherer;
use swarm_story::sim_reserve::ReservePool;
use swarm_story::sim_schedule::{ActionSink, ApplyError};
use swarm_story::sim_story::{ActionKind, ScenarioAction};

/// One simulated swarm member.
pub struct SimClient {
    id: NodeId,
    role: NodeRole,
    state: CompletionState,
}

impl SimClient {
    fn new(id: NodeId, role: NodeRole) -> Self {
        SimClient { id, role, state: CompletionState::NotStarted }
    }

    fn start(&mut self) {
        self.state = CompletionState::InProgress;
    }

    /// Download finished; a client that already departed stays failed.
    fn complete(&mut self) {
        if self.state == CompletionState::InProgress {
            self.state = CompletionState::Completed;
        }
    }

    /// Churn: an unfinished task counts as failed, a finished one stays done.
    fn depart(&mut self) {
        if self.state == CompletionState::InProgress {
            self.state = CompletionState::Failed;
        }
    }
}

impl Participant for SimClient {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn role(&self) -> NodeRole {
        self.role
    }

    fn report_progress(&self) -> CompletionState {
        self.state
    }
}

/// Applies story actions to the synthetic swarm.
pub struct SwarmSink {
    gatherer: Rc<RefCell<MetricsGatherer>>,
    reserve: Rc<RefCell<ReservePool>>,
    clients: BTreeMap<NodeId, Rc<RefCell<SimClient>>>,
    tracker: Option<NodeId>,
    rng: StdRng,
    /// Download duration drawn uniformly from this window (ms).
    completion_window: (SimTime, SimTime),
}

impl SwarmSink {
    pub fn new(
        gatherer: Rc<RefCell<MetricsGatherer>>,
        reserve: Rc<RefCell<ReservePool>>,
        rng: StdRng,
        completion_window: (SimTime, SimTime),
    ) -> Self {
        SwarmSink {
            gatherer,
            reserve,
            clients: BTreeMap::new(),
            tracker: None,
            rng,
            completion_window,
        }
    }

    pub fn tracker(&self) -> Option<&NodeId> {
        self.tracker.as_ref()
    }

    fn join_one(
        &mut self,
        action: &ScenarioAction,
        target: &NodeId,
        clock: &mut dyn SimulationClock,
    ) -> Result<(), ApplyError> {
        if action.is_deferred() {
            // admission action: the node must still be waiting in the pool
            self.reserve
                .borrow_mut()
                .promote(target)
                .map_err(|_| ApplyError::UnknownTarget(target.clone()))?;
        }
        if self.clients.contains_key(target) {
            return Err(ApplyError::Rejected {
                reason: format!("node {} already joined", target),
            });
        }

        let client = Rc::new(RefCell::new(SimClient::new(target.clone(), NodeRole::Client)));
        client.borrow_mut().start();
        self.clients.insert(target.clone(), client.clone());
        self.gatherer.borrow_mut().register_participant(client.clone());

        let (min, max) = self.completion_window;
        let duration = self.rng.gen_range(min..=max);
        let done_at = clock.now() + duration;
        clock.schedule_at(
            done_at,
            Box::new(move |_| {
                client.borrow_mut().complete();
            }),
        );
        info!("{} joined at {}ms, completes at {}ms", target, clock.now(), done_at);
        Ok(())
    }
}

impl ActionSink for SwarmSink {
    fn apply(
        &mut self,
        action: &ScenarioAction,
        clock: &mut dyn SimulationClock,
    ) -> Result<(), ApplyError> {
        match action.kind {
            ActionKind::Note => {
                info!("story note at {}ms: {}", clock.now(), action.param("text").unwrap_or(""));
                Ok(())
            }
            ActionKind::TrackerRegister => {
                for target in &action.targets {
                    let tracker =
                        Rc::new(RefCell::new(SimClient::new(target.clone(), NodeRole::Tracker)));
                    self.clients.insert(target.clone(), tracker);
                    self.tracker = Some(target.clone());
                    info!(
                        "tracker {} registered at {}ms (torrent: {})",
                        target,
                        clock.now(),
                        action.param("torrent").unwrap_or("<default>")
                    );
                }
                Ok(())
            }
            ActionKind::NodeJoin => {
                for target in &action.targets {
                    self.join_one(action, target, clock)?;
                }
                Ok(())
            }
            ActionKind::NodeLeave => {
                for target in &action.targets {
                    let client = self
                        .clients
                        .get(target)
                        .ok_or_else(|| ApplyError::UnknownTarget(target.clone()))?;
                    client.borrow_mut().depart();
                    info!("{} left at {}ms", target, clock.now());
                }
                Ok(())
            }
        }
    }
}
