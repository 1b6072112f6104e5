//! Partition oracle: which story actions does this process own?
//!
//! Every cooperating process parses the same full story but only schedules
//! the slice it owns, so total behavior is invariant under the number of
//! partitions. The assignment is validated at construction: an unclaimed or
//! doubly-claimed node is a consistency violation that must abort before the
//! run starts, not be discovered mid-run.

use std::fmt;

use hashbrown::HashMap;

use crate::sim_interface::{NodeId, PartitionProvider, ProcessId};

/// Answers whether a node's actions are locally owned.
#[derive(Debug, Clone)]
pub struct PartitionOracle {
    local: ProcessId,
    /// `None` in single-process mode: everything is local.
    assignments: Option<HashMap<NodeId, ProcessId>>,
}

impl PartitionOracle {
    /// Single-process mode: every node is owned locally.
    pub fn single_process() -> Self {
        PartitionOracle { local: 0, assignments: None }
    }

    /// Partitioned mode. `claims` is the full node-to-process assignment as
    /// published by the topology layer; `all_nodes` is the set of nodes the
    /// story references. Each node must be claimed by exactly one process.
    pub fn partitioned(
        local: ProcessId,
        claims: impl IntoIterator<Item = (NodeId, ProcessId)>,
        all_nodes: impl IntoIterator<Item = NodeId>,
    ) -> Result<Self, PartitionError> {
        let mut assignments: HashMap<NodeId, ProcessId> = HashMap::new();
        for (node, process) in claims {
            if let Some(previous) = assignments.insert(node.clone(), process) {
                if previous != process {
                    return Err(PartitionError::DoublyClaimed { node, first: previous, second: process });
                }
            }
        }
        for node in all_nodes {
            if !assignments.contains_key(&node) {
                return Err(PartitionError::UnclaimedNode(node));
            }
        }
        Ok(PartitionOracle { local, assignments: Some(assignments) })
    }

    pub fn local_process(&self) -> ProcessId {
        self.local
    }

    /// True iff `node`'s actions are scheduled by this process.
    pub fn owns(&self, node: &NodeId) -> bool {
        match &self.assignments {
            None => true,
            Some(map) => map.get(node) == Some(&self.local),
        }
    }
}

impl PartitionProvider for PartitionOracle {
    fn owner_of(&self, node: &NodeId) -> Option<ProcessId> {
        match &self.assignments {
            None => Some(self.local),
            Some(map) => map.get(node).copied(),
        }
    }
}

/// Violations of the partitioning contract; fatal before the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// No process claims this node.
    UnclaimedNode(NodeId),

    /// Two processes claim this node.
    DoublyClaimed { node: NodeId, first: ProcessId, second: ProcessId },
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionError::UnclaimedNode(node) => {
                write!(f, "node {} is not claimed by any process", node)
            }
            PartitionError::DoublyClaimed { node, first, second } => {
                write!(f, "node {} is claimed by processes {} and {}", node, first, second)
            }
        }
    }
}
