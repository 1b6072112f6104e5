// Minimal single-process discrete-event kernel backing the story runner.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use swarm_story::sim_interface::{SimEvent, SimTime, SimulationClock};

struct QueuedEvent {
    time: SimTime,
    seq: u64,
    event: SimEvent,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    // reversed so the BinaryHeap pops the earliest (time, seq) first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

/// Event-queue clock executing callbacks in strict `(time, insertion)` order.
pub struct EventQueueClock {
    now: SimTime,
    seq: u64,
    queue: BinaryHeap<QueuedEvent>,
    stop_at: Option<SimTime>,
}

impl EventQueueClock {
    pub fn new() -> Self {
        EventQueueClock { now: 0, seq: 0, queue: BinaryHeap::new(), stop_at: None }
    }

    /// Run until the queue empties or a stop request cuts it off.
    /// Returns the final simulated time.
    pub fn run(&mut self) -> SimTime {
        while let Some(queued) = self.queue.pop() {
            if self.stop_at.map_or(false, |stop| queued.time > stop) {
                // a stop request atomically drops all not-yet-fired events
                self.queue.clear();
                break;
            }
            self.now = queued.time;
            (queued.event)(self);
        }
        self.now
    }
}

impl SimulationClock for EventQueueClock {
    fn now(&self) -> SimTime {
        self.now
    }

    fn schedule_at(&mut self, time: SimTime, event: SimEvent) {
        let time = time.max(self.now);
        self.queue.push(QueuedEvent { time, seq: self.seq, event });
        self.seq += 1;
    }

    fn request_stop(&mut self, at_or_after: SimTime) {
        self.stop_at = Some(self.stop_at.map_or(at_or_after, |s| s.min(at_or_after)));
    }
}
