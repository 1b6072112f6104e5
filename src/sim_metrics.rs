//! Global metrics gatherer: adaptive, data-driven run termination.
//!
//! The gatherer samples per-participant completion at a fixed cadence on a
//! self-rescheduling tick and stops the simulation once a configured
//! fraction of the total eligible population (active participants plus the
//! reserve pool of not-yet-admitted ones) has completed its task. The stop
//! request lands a small grace offset past the horizon so simultaneously
//! scheduled final actions still flush.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::sim_interface::{
    repeat_every, CompletionState, NodeId, Participant, SimTime, SimulationClock, TaskHandle,
    MILLIS_PER_SECOND,
};
use crate::sim_report::{wallclock_time, ReportWriter};
use crate::sim_reserve::ReservePool;

/// Grace offset added to the horizon when requesting a stop.
pub const STOP_GRACE_MS: SimTime = 1;

/// Default sampling cadence: one simulated second.
pub const DEFAULT_TICK_PERIOD_MS: SimTime = MILLIS_PER_SECOND;

// ============================================================================
// Stop Policy
// ============================================================================

/// Completion-fraction thresholds controlling early termination.
///
/// Mirrors the two-argument stop-fraction contract of the driver:
/// `active_fraction` is the completion ratio that triggers the stop, with a
/// negative value meaning "never auto-stop, rely on an external stop only"
/// (emulation mode). `reserve_fraction` weights the reserve pool in the
/// population denominator; a negative value disables reserve accounting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopPolicy {
    active_fraction: f64,
    reserve_fraction: f64,
}

impl StopPolicy {
    pub fn new(active_fraction: f64, reserve_fraction: f64) -> Result<Self, ConfigError> {
        if active_fraction.is_nan() || active_fraction > 1.0 {
            return Err(ConfigError::InvalidStopFraction {
                name: "active_fraction",
                value: active_fraction,
            });
        }
        if reserve_fraction.is_nan() || reserve_fraction > 1.0 {
            return Err(ConfigError::InvalidStopFraction {
                name: "reserve_fraction",
                value: reserve_fraction,
            });
        }
        Ok(StopPolicy { active_fraction, reserve_fraction })
    }

    pub fn active_fraction(&self) -> f64 {
        self.active_fraction
    }

    pub fn reserve_fraction(&self) -> f64 {
        self.reserve_fraction
    }

    pub fn never_auto_stop(&self) -> bool {
        self.active_fraction < 0.0
    }

    pub fn reserve_enabled(&self) -> bool {
        self.reserve_fraction >= 0.0
    }
}

/// Invalid startup configuration; fatal before the run begins.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidStopFraction { name: &'static str, value: f64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidStopFraction { name, value } => {
                write!(f, "{} must lie in [0, 1] (or be the negative sentinel), got {}", name, value)
            }
        }
    }
}

// ============================================================================
// Gatherer
// ============================================================================

/// Lifecycle of the gatherer over one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GathererState {
    /// Created; no participants registered yet.
    Configured,

    /// Participants registered, periodic sampling active.
    Collecting,

    /// Stop condition met; stop request issued to the clock.
    Stopping,

    /// Final report entry written.
    Finalized,
}

/// Per-participant record, retained for the final report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantMetric {
    pub id: NodeId,
    pub state: CompletionState,
    pub last_sample: SimTime,
}

pub struct MetricsGatherer {
    state: GathererState,
    policy: StopPolicy,
    tick_period: SimTime,
    horizon: SimTime,
    participants: Vec<Rc<RefCell<dyn Participant>>>,
    metrics: BTreeMap<NodeId, ParticipantMetric>,
    reserve: Option<Rc<RefCell<ReservePool>>>,
    external_clients: usize,
    report: ReportWriter,
    tick_handle: Option<TaskHandle>,
    stopped_at: Option<SimTime>,
}

impl MetricsGatherer {
    /// `horizon` is the configured maximum runtime in milliseconds.
    pub fn new(policy: StopPolicy, horizon: SimTime, report: ReportWriter) -> Self {
        MetricsGatherer {
            state: GathererState::Configured,
            policy,
            tick_period: DEFAULT_TICK_PERIOD_MS,
            horizon,
            participants: Vec::new(),
            metrics: BTreeMap::new(),
            reserve: None,
            external_clients: 0,
            report,
            tick_handle: None,
            stopped_at: None,
        }
    }

    pub fn set_tick_period(&mut self, period: SimTime) {
        self.tick_period = period.max(1);
    }

    /// Take shared ownership of the reserve pool for population accounting.
    pub fn attach_reserve(&mut self, pool: Rc<RefCell<ReservePool>>) {
        self.reserve = Some(pool);
    }

    /// Count externally attached (emulated) clients in the population.
    pub fn announce_external_clients(&mut self, count: usize) {
        self.external_clients = count;
    }

    pub fn register_participants(
        &mut self,
        participants: impl IntoIterator<Item = Rc<RefCell<dyn Participant>>>,
    ) {
        for participant in participants {
            self.register_participant(participant);
        }
    }

    pub fn register_participant(&mut self, participant: Rc<RefCell<dyn Participant>>) {
        let id = participant.borrow().id().clone();
        debug!("metrics: registering participant {}", id);
        self.metrics.insert(
            id.clone(),
            ParticipantMetric { id, state: CompletionState::NotStarted, last_sample: 0 },
        );
        self.participants.push(participant);
        if self.state == GathererState::Configured {
            self.state = GathererState::Collecting;
        }
    }

    pub fn state(&self) -> GathererState {
        self.state
    }

    /// Simulated time at which the stop condition was met, if it was.
    pub fn stopped_at(&self) -> Option<SimTime> {
        self.stopped_at
    }

    pub fn metrics(&self) -> &BTreeMap<NodeId, ParticipantMetric> {
        &self.metrics
    }

    pub fn active_count(&self) -> usize {
        self.participants.len()
    }

    pub fn completed_count(&self) -> usize {
        self.metrics.values().filter(|m| m.state == CompletionState::Completed).count()
    }

    /// Poll every registered participant and fold its report into the
    /// per-participant records.
    pub fn sample(&mut self, now: SimTime) {
        for participant in &self.participants {
            let participant = participant.borrow();
            let state = participant.report_progress();
            if let Some(metric) = self.metrics.get_mut(participant.id()) {
                metric.state = state;
                metric.last_sample = now;
            }
        }
    }

    /// Swarm-wide completion fraction over the total eligible population:
    /// active participants, announced external clients and (when reserve
    /// accounting is enabled) the weighted reserve pool.
    pub fn completion_fraction(&self) -> f64 {
        let mut denominator = (self.participants.len() + self.external_clients) as f64;
        if self.policy.reserve_enabled() {
            if let Some(pool) = &self.reserve {
                denominator += self.policy.reserve_fraction() * pool.borrow().size() as f64;
            }
        }
        if denominator <= 0.0 {
            return 0.0;
        }
        self.completed_count() as f64 / denominator
    }

    fn should_stop(&self) -> bool {
        if self.policy.never_auto_stop() {
            return false;
        }
        let population = self.participants.len() + self.external_clients;
        let reserved = self.reserve.as_ref().map_or(0, |p| p.borrow().size());
        if population + reserved == 0 {
            return false;
        }
        self.completion_fraction() >= self.policy.active_fraction()
    }

    /// Arm the periodic sampling tick. The tick re-arms itself every period
    /// until the gatherer reaches a terminal state; armed before the first
    /// registration it ticks idle until participants arrive.
    pub fn arm(this: &Rc<RefCell<Self>>, clock: &mut dyn SimulationClock) {
        let period = this.borrow().tick_period;
        let gatherer = Rc::clone(this);
        let handle = repeat_every(clock, period, move |c| MetricsGatherer::tick_once(&gatherer, c));
        this.borrow_mut().tick_handle = Some(handle);
    }

    /// One sampling pass. Returns whether the tick should re-arm.
    fn tick_once(this: &Rc<RefCell<Self>>, clock: &mut dyn SimulationClock) -> bool {
        let now = clock.now();
        let mut gatherer = this.borrow_mut();
        match gatherer.state {
            // armed before the first participant joined; keep ticking idle
            GathererState::Configured => return true,
            GathererState::Stopping | GathererState::Finalized => return false,
            GathererState::Collecting => {}
        }
        gatherer.sample(now);
        let fraction = gatherer.completion_fraction();
        gatherer.report.write("completion", &format!("{}ms {:.4}", now, fraction), false);

        if gatherer.should_stop() {
            gatherer.state = GathererState::Stopping;
            gatherer.stopped_at = Some(now);
            clock.request_stop(gatherer.horizon + STOP_GRACE_MS);
            gatherer.finish();
            return false;
        }
        true
    }

    /// Externally signaled stop (emulation mode). The only stop path when
    /// the policy never auto-stops.
    pub fn external_stop(&mut self, clock: &mut dyn SimulationClock) {
        if matches!(self.state, GathererState::Stopping | GathererState::Finalized) {
            return;
        }
        self.state = GathererState::Stopping;
        self.stopped_at = Some(clock.now());
        clock.request_stop(clock.now());
        self.finish();
    }

    /// Close out the run if the horizon was reached without a stop decision.
    pub fn finish_at_horizon(&mut self) {
        if self.state != GathererState::Finalized {
            self.finish();
        }
    }

    /// Write a report entry on behalf of the driver.
    pub fn write_to_file(&self, label: &str, stamp: &str, is_final: bool) {
        self.report.write(label, stamp, is_final);
    }

    fn finish(&mut self) {
        if let Some(handle) = &self.tick_handle {
            handle.cancel();
        }
        self.report.write("simulation-finished", &wallclock_time(), true);
        self.state = GathererState::Finalized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_interface::{NodeRole, SimEvent};
    use crate::sim_reserve::ReserveEntry;
    use crate::sim_story::{ActionKind, ScenarioAction};
    use indexmap::IndexMap;
    use std::cell::Cell;

    struct TestClock {
        now: SimTime,
        seq: u64,
        queue: Vec<(SimTime, u64, SimEvent)>,
        stop_at: Option<SimTime>,
    }

    impl TestClock {
        fn new() -> Self {
            TestClock { now: 0, seq: 0, queue: Vec::new(), stop_at: None }
        }

        fn run(&mut self) {
            while !self.queue.is_empty() {
                let idx = self
                    .queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, (t, s, _))| (*t, *s))
                    .map(|(i, _)| i)
                    .unwrap();
                let (time, _, event) = self.queue.remove(idx);
                if self.stop_at.map_or(false, |stop| time > stop) {
                    self.queue.clear();
                    break;
                }
                self.now = time;
                event(self);
            }
        }
    }

    impl SimulationClock for TestClock {
        fn now(&self) -> SimTime {
            self.now
        }

        fn schedule_at(&mut self, time: SimTime, event: SimEvent) {
            let time = time.max(self.now);
            self.queue.push((time, self.seq, event));
            self.seq += 1;
        }

        fn request_stop(&mut self, at_or_after: SimTime) {
            self.stop_at = Some(self.stop_at.map_or(at_or_after, |s| s.min(at_or_after)));
        }
    }

    struct FakeParticipant {
        id: NodeId,
        state: Cell<CompletionState>,
    }

    impl FakeParticipant {
        fn new(name: &str) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(FakeParticipant {
                id: NodeId::from(name),
                state: Cell::new(CompletionState::InProgress),
            }))
        }
    }

    impl Participant for FakeParticipant {
        fn id(&self) -> &NodeId {
            &self.id
        }

        fn role(&self) -> NodeRole {
            NodeRole::Client
        }

        fn report_progress(&self) -> CompletionState {
            self.state.get()
        }
    }

    fn reserve_entry(name: &str) -> ReserveEntry {
        let id = NodeId::from(name);
        ReserveEntry {
            id: id.clone(),
            admission: ScenarioAction {
                fire_time: 0,
                kind: ActionKind::NodeJoin,
                targets: vec![id],
                params: IndexMap::new(),
                story_index: 0,
            },
        }
    }

    fn gatherer_with(
        policy: StopPolicy,
        horizon: SimTime,
    ) -> Rc<RefCell<MetricsGatherer>> {
        Rc::new(RefCell::new(MetricsGatherer::new(
            policy,
            horizon,
            ReportWriter::new("metrics-test", false),
        )))
    }

    fn complete_at(
        clock: &mut TestClock,
        participant: &Rc<RefCell<FakeParticipant>>,
        time: SimTime,
    ) {
        let participant = Rc::clone(participant);
        clock.schedule_at(
            time,
            Box::new(move |_| {
                participant.borrow().state.set(CompletionState::Completed);
            }),
        );
    }

    #[test]
    fn test_invalid_stop_fractions_rejected() {
        assert!(matches!(
            StopPolicy::new(1.5, 1.0),
            Err(ConfigError::InvalidStopFraction { name: "active_fraction", .. })
        ));
        assert!(matches!(
            StopPolicy::new(1.0, 2.0),
            Err(ConfigError::InvalidStopFraction { name: "reserve_fraction", .. })
        ));
        assert!(StopPolicy::new(f64::NAN, 1.0).is_err());

        // negative values are the documented sentinels, not errors
        let emulation = StopPolicy::new(-1.0, 1.0).unwrap();
        assert!(emulation.never_auto_stop());
        let no_reserve = StopPolicy::new(1.0, -1.0).unwrap();
        assert!(!no_reserve.reserve_enabled());
    }

    #[test]
    fn test_state_machine_transitions() {
        let gatherer = gatherer_with(StopPolicy::new(1.0, 1.0).unwrap(), 25_000);
        assert_eq!(gatherer.borrow().state(), GathererState::Configured);

        let p = FakeParticipant::new("n1");
        gatherer.borrow_mut().register_participant(p);
        assert_eq!(gatherer.borrow().state(), GathererState::Collecting);

        gatherer.borrow_mut().finish_at_horizon();
        assert_eq!(gatherer.borrow().state(), GathererState::Finalized);
    }

    #[test]
    fn test_stops_at_first_tick_reaching_threshold() {
        // 4 active + 1 reserved, threshold 0.8: needs all 4 active completed
        let gatherer = gatherer_with(StopPolicy::new(0.8, 1.0).unwrap(), 25_000);
        let pool = Rc::new(RefCell::new(
            ReservePool::from_entries(vec![reserve_entry("late1")]).unwrap(),
        ));
        gatherer.borrow_mut().attach_reserve(Rc::clone(&pool));

        let mut clock = TestClock::new();
        let participants: Vec<_> =
            ["n1", "n2", "n3", "n4"].iter().map(|n| FakeParticipant::new(n)).collect();
        for (i, p) in participants.iter().enumerate() {
            gatherer.borrow_mut().register_participant(p.clone());
            complete_at(&mut clock, p, 1500 + 1000 * i as SimTime);
        }

        MetricsGatherer::arm(&gatherer, &mut clock);
        clock.request_stop(25_000 + STOP_GRACE_MS);
        clock.run();

        // 3/5 = 0.6 at the 4000ms tick; 4/5 = 0.8 first holds at 5000ms
        assert_eq!(gatherer.borrow().stopped_at(), Some(5000));
        assert_eq!(gatherer.borrow().state(), GathererState::Finalized);
        assert_eq!(clock.stop_at, Some(25_001));
    }

    #[test]
    fn test_reserve_disabled_counts_active_only() {
        let gatherer = gatherer_with(StopPolicy::new(1.0, -1.0).unwrap(), 25_000);
        let pool = Rc::new(RefCell::new(
            ReservePool::from_entries(vec![reserve_entry("late1"), reserve_entry("late2")])
                .unwrap(),
        ));
        gatherer.borrow_mut().attach_reserve(pool);

        let mut clock = TestClock::new();
        let p1 = FakeParticipant::new("n1");
        let p2 = FakeParticipant::new("n2");
        gatherer.borrow_mut().register_participant(p1.clone());
        gatherer.borrow_mut().register_participant(p2.clone());
        complete_at(&mut clock, &p1, 500);
        complete_at(&mut clock, &p2, 1500);

        MetricsGatherer::arm(&gatherer, &mut clock);
        clock.run();

        // both active done at the 2000ms tick; the untouched reserve is ignored
        assert_eq!(gatherer.borrow().stopped_at(), Some(2000));
    }

    #[test]
    fn test_never_auto_stop_sentinel() {
        let gatherer = gatherer_with(StopPolicy::new(-1.0, 1.0).unwrap(), 10_000);
        let mut clock = TestClock::new();
        let p = FakeParticipant::new("n1");
        gatherer.borrow_mut().register_participant(p.clone());
        complete_at(&mut clock, &p, 500);

        MetricsGatherer::arm(&gatherer, &mut clock);
        clock.request_stop(10_000 + STOP_GRACE_MS);
        clock.run();

        // completion alone never stops the run under the sentinel
        assert_eq!(gatherer.borrow().stopped_at(), None);
        assert_eq!(gatherer.borrow().state(), GathererState::Collecting);

        // the externally signaled stop is still honored
        gatherer.borrow_mut().external_stop(&mut clock);
        assert_eq!(gatherer.borrow().state(), GathererState::Finalized);
        assert_eq!(gatherer.borrow().stopped_at(), Some(10_000));
    }

    #[test]
    fn test_promotion_moves_population_without_losing_it() {
        let gatherer = gatherer_with(StopPolicy::new(1.0, 1.0).unwrap(), 25_000);
        let pool = Rc::new(RefCell::new(
            ReservePool::from_entries(vec![reserve_entry("late1")]).unwrap(),
        ));
        gatherer.borrow_mut().attach_reserve(Rc::clone(&pool));

        let p1 = FakeParticipant::new("n1");
        gatherer.borrow_mut().register_participant(p1.clone());
        p1.borrow().state.set(CompletionState::Completed);
        gatherer.borrow_mut().sample(1000);

        // 1 completed of (1 active + 1 reserved)
        assert_eq!(gatherer.borrow().completion_fraction(), 0.5);

        // admission: the entry leaves the pool and joins the active set
        pool.borrow_mut().promote(&NodeId::from("late1")).unwrap();
        let late = FakeParticipant::new("late1");
        gatherer.borrow_mut().register_participant(late.clone());
        assert_eq!(gatherer.borrow().completion_fraction(), 0.5);

        late.borrow().state.set(CompletionState::Completed);
        gatherer.borrow_mut().sample(2000);
        assert_eq!(gatherer.borrow().completion_fraction(), 1.0);
    }

    #[test]
    fn test_tick_survives_arming_before_first_join() {
        // the driver arms the gatherer before any story action has fired,
        // so the first ticks see an empty population and must keep ticking
        let gatherer = gatherer_with(StopPolicy::new(1.0, -1.0).unwrap(), 25_000);
        let mut clock = TestClock::new();

        MetricsGatherer::arm(&gatherer, &mut clock);
        let late_gatherer = Rc::clone(&gatherer);
        let p = FakeParticipant::new("n1");
        let joined = Rc::clone(&p);
        clock.schedule_at(
            1000,
            Box::new(move |_| {
                late_gatherer.borrow_mut().register_participant(joined);
            }),
        );
        complete_at(&mut clock, &p, 1500);
        clock.request_stop(25_000 + STOP_GRACE_MS);
        clock.run();

        // first tick after completion is at 2000ms; the idle t=0 tick must
        // not have killed the cycle
        assert_eq!(gatherer.borrow().stopped_at(), Some(2000));
        assert_eq!(gatherer.borrow().state(), GathererState::Finalized);
    }

    #[test]
    fn test_external_clients_enter_the_denominator() {
        let gatherer = gatherer_with(StopPolicy::new(1.0, 1.0).unwrap(), 25_000);
        let p1 = FakeParticipant::new("n1");
        let p2 = FakeParticipant::new("n2");
        let batch: Vec<Rc<RefCell<dyn Participant>>> = vec![p1.clone(), p2.clone()];
        gatherer.borrow_mut().register_participants(batch);
        gatherer.borrow_mut().announce_external_clients(2);

        p1.borrow().state.set(CompletionState::Completed);
        p2.borrow().state.set(CompletionState::Completed);
        gatherer.borrow_mut().sample(1000);

        // 2 completed of (2 active + 2 emulated clients outside this process)
        assert_eq!(gatherer.borrow().completion_fraction(), 0.5);
    }

    #[test]
    fn test_failed_participants_stay_in_denominator() {
        let gatherer = gatherer_with(StopPolicy::new(1.0, 1.0).unwrap(), 25_000);
        let p1 = FakeParticipant::new("n1");
        let p2 = FakeParticipant::new("n2");
        gatherer.borrow_mut().register_participant(p1.clone());
        gatherer.borrow_mut().register_participant(p2.clone());

        p1.borrow().state.set(CompletionState::Completed);
        p2.borrow().state.set(CompletionState::Failed);
        gatherer.borrow_mut().sample(1000);

        assert_eq!(gatherer.borrow().completed_count(), 1);
        assert_eq!(gatherer.borrow().completion_fraction(), 0.5);
        let metrics = gatherer.borrow().metrics().clone();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[&NodeId::from("n2")].state, CompletionState::Failed);
        assert_eq!(metrics[&NodeId::from("n2")].last_sample, 1000);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let run = || {
            let gatherer = gatherer_with(StopPolicy::new(0.5, 1.0).unwrap(), 25_000);
            let mut clock = TestClock::new();
            let participants: Vec<_> =
                ["n1", "n2", "n3", "n4"].iter().map(|n| FakeParticipant::new(n)).collect();
            for (i, p) in participants.iter().enumerate() {
                gatherer.borrow_mut().register_participant(p.clone());
                complete_at(&mut clock, p, 700 * (i as SimTime + 1));
            }
            MetricsGatherer::arm(&gatherer, &mut clock);
            clock.request_stop(25_000 + STOP_GRACE_MS);
            clock.run();
            let g = gatherer.borrow();
            (g.stopped_at(), g.metrics().clone())
        };

        let (stop_a, metrics_a) = run();
        let (stop_b, metrics_b) = run();
        assert_eq!(stop_a, stop_b);
        assert_eq!(metrics_a, metrics_b);
    }
}
