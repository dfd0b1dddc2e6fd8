//! In-memory points ledger.

use parking_lot::Mutex;

use crate::core::{EngineResult, PointsLedger, TaskId};

/// One recorded debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    /// Debited owner.
    pub owner: String,
    /// Points taken.
    pub points: u32,
    /// Task charged for.
    pub task_id: TaskId,
}

/// Append-only ledger for development/testing.
#[derive(Default)]
pub struct InMemoryLedger {
    charges: Mutex<Vec<Charge>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// All charges in recording order.
    pub fn charges(&self) -> Vec<Charge> {
        self.charges.lock().clone()
    }

    /// Number of charges recorded for `task_id`.
    pub fn charges_for(&self, task_id: &TaskId) -> usize {
        self.charges.lock().iter().filter(|c| &c.task_id == task_id).count()
    }

    /// Total points debited from `owner`.
    pub fn total_for(&self, owner: &str) -> u64 {
        self.charges
            .lock()
            .iter()
            .filter(|c| c.owner == owner)
            .map(|c| u64::from(c.points))
            .sum()
    }
}

impl PointsLedger for InMemoryLedger {
    fn deduct(&self, owner: &str, points: u32, task_id: &TaskId) -> EngineResult<()> {
        self.charges.lock().push(Charge {
            owner: owner.to_owned(),
            points,
            task_id: task_id.clone(),
        });
        Ok(())
    }
}
