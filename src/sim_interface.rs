use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

// all simulated time is in milliseconds to allow casting/interop
pub type SimTime = u64;
pub type ProcessId = u32;

pub const MILLIS_PER_SECOND: SimTime = 1000;

/// Identity of a simulated node, as named in the story file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        NodeId(name.to_string())
    }
}

/// Role attached to a node at creation time.
///
/// Replaces runtime type probing of the node's application: the scheduler and
/// the metrics gatherer query the role directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Tracker,
    Client,
    Router,
    Other,
}

/// Completion state reported by a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// A unit of work registered with the simulation clock.
///
/// Events receive the clock itself so they can schedule follow-up work
/// (the self-rescheduling periodic tick relies on this).
pub type SimEvent = Box<dyn FnOnce(&mut dyn SimulationClock)>;

/// The discrete-event kernel's clock, as consumed by this crate.
///
/// The kernel itself is an external collaborator; the driver binary ships a
/// minimal single-process implementation and tests use in-module doubles.
pub trait SimulationClock {
    /// Current simulated time.
    fn now(&self) -> SimTime;

    /// Register `event` to execute at simulated time `time`.
    fn schedule_at(&mut self, time: SimTime, event: SimEvent);

    /// Register `event` to execute at the current simulated time.
    fn schedule_now(&mut self, event: SimEvent) {
        let now = self.now();
        self.schedule_at(now, event);
    }

    /// Ask the kernel to stop the run. Events scheduled past `at_or_after`
    /// are dropped without executing.
    fn request_stop(&mut self, at_or_after: SimTime);
}

/// Node-to-process assignment lookup provided by the topology layer.
pub trait PartitionProvider {
    fn owner_of(&self, node: &NodeId) -> Option<ProcessId>;
}

/// A registered experiment participant, polled by the metrics gatherer.
pub trait Participant {
    fn id(&self) -> &NodeId;

    fn role(&self) -> NodeRole;

    fn report_progress(&self) -> CompletionState;
}

// ============================================================================
// Repeating Tasks
// ============================================================================

/// Cancellation handle for a task armed with [`repeat_every`].
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Arm a periodic task on the clock.
///
/// The task fires once at the current simulated time and re-arms itself every
/// `period` until it returns `false` or the returned handle is cancelled.
/// Because the re-arm happens inside the fired event, a terminal task stops
/// cleanly without any kernel-level repeating timer.
pub fn repeat_every(
    clock: &mut dyn SimulationClock,
    period: SimTime,
    task: impl FnMut(&mut dyn SimulationClock) -> bool + 'static,
) -> TaskHandle {
    let handle = TaskHandle::default();
    let first = clock.now();
    arm(clock, first, period, handle.cancelled.clone(), Box::new(task));
    handle
}

fn arm(
    clock: &mut dyn SimulationClock,
    time: SimTime,
    period: SimTime,
    cancelled: Rc<Cell<bool>>,
    mut task: Box<dyn FnMut(&mut dyn SimulationClock) -> bool>,
) {
    clock.schedule_at(
        time,
        Box::new(move |c| {
            if cancelled.get() {
                return;
            }
            let rearm = task(c);
            if rearm && !cancelled.get() {
                let next = c.now() + period;
                arm(c, next, period, cancelled, task);
            }
        }),
    );
}
