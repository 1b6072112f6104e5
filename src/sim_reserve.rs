//! Reserve pool: deferred-admission participants.
//!
//! Entries are produced once during story parsing and consumed exactly once,
//! either by an admission action firing (`promote`) or by bulk hand-off at
//! setup time (`drain_all`). Ownership transfers out of the pool on either
//! path; a second attempt on the same identity fails with `NotFound`.

use std::fmt;

use indexmap::IndexMap;

use crate::sim_interface::NodeId;
use crate::sim_story::ScenarioAction;

/// A participant identity plus its intended admission action.
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveEntry {
    pub id: NodeId,
    pub admission: ScenarioAction,
}

/// Ordered collection of participants not yet admitted to the swarm.
#[derive(Debug, Default)]
pub struct ReservePool {
    entries: IndexMap<NodeId, ReserveEntry>,
}

impl ReservePool {
    pub fn new() -> Self {
        ReservePool::default()
    }

    /// Build a pool from parse-time entries, rejecting duplicate identities.
    pub fn from_entries(entries: Vec<ReserveEntry>) -> Result<Self, ReserveError> {
        let mut pool = ReservePool::new();
        for entry in entries {
            pool.enqueue(entry)?;
        }
        Ok(pool)
    }

    pub fn enqueue(&mut self, entry: ReserveEntry) -> Result<(), ReserveError> {
        if self.entries.contains_key(&entry.id) {
            return Err(ReserveError::Duplicate(entry.id));
        }
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Move one entry out of the pool for admission.
    pub fn promote(&mut self, id: &NodeId) -> Result<ReserveEntry, ReserveError> {
        self.entries
            .shift_remove(id)
            .ok_or_else(|| ReserveError::NotFound(id.clone()))
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand every remaining entry over to the caller, in insertion order.
    /// The pool is empty afterwards.
    pub fn drain_all(&mut self) -> Vec<ReserveEntry> {
        self.entries.drain(..).map(|(_, entry)| entry).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    /// The identity is already waiting in the pool.
    Duplicate(NodeId),

    /// The identity is not in the pool (already promoted or drained).
    NotFound(NodeId),
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReserveError::Duplicate(id) => write!(f, "node {} is already in the reserve pool", id),
            ReserveError::NotFound(id) => write!(f, "node {} is not in the reserve pool", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_story::ActionKind;
    use indexmap::IndexMap as Params;

    fn entry(name: &str) -> ReserveEntry {
        let id = NodeId::from(name);
        ReserveEntry {
            id: id.clone(),
            admission: ScenarioAction {
                fire_time: 12_000,
                kind: ActionKind::NodeJoin,
                targets: vec![id],
                params: Params::new(),
                story_index: 0,
            },
        }
    }

    #[test]
    fn test_enqueue_then_promote() {
        let mut pool = ReservePool::new();
        pool.enqueue(entry("late1")).unwrap();
        assert_eq!(pool.size(), 1);

        let promoted = pool.promote(&NodeId::from("late1")).unwrap();
        assert_eq!(promoted.id, NodeId::from("late1"));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_second_promote_fails_not_found() {
        let mut pool = ReservePool::from_entries(vec![entry("late1")]).unwrap();
        pool.promote(&NodeId::from("late1")).unwrap();

        let err = pool.promote(&NodeId::from("late1")).unwrap_err();
        assert_eq!(err, ReserveError::NotFound(NodeId::from("late1")));
    }

    #[test]
    fn test_duplicate_enqueue_rejected() {
        let mut pool = ReservePool::new();
        pool.enqueue(entry("late1")).unwrap();
        let err = pool.enqueue(entry("late1")).unwrap_err();
        assert_eq!(err, ReserveError::Duplicate(NodeId::from("late1")));
    }

    #[test]
    fn test_drain_all_empties_pool_in_order() {
        let mut pool =
            ReservePool::from_entries(vec![entry("a"), entry("b"), entry("c")]).unwrap();
        let drained = pool.drain_all();
        let ids: Vec<&str> = drained.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_promote_after_drain_fails_not_found() {
        let mut pool = ReservePool::from_entries(vec![entry("a")]).unwrap();
        pool.drain_all();
        assert!(matches!(
            pool.promote(&NodeId::from("a")),
            Err(ReserveError::NotFound(_))
        ));
    }
}
