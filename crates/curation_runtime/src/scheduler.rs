//! Deterministic rule scheduler.
//!
//! The scheduler owns no tasks. It walks the execution order and tells the
//! engine which rule to start next:
//! - a rule is ready once every predecessor (declared or table-overlap) has
//!   settled, so rules on one chain never overlap in time
//! - among ready rules the earliest in execution order wins
//! - a rule with a failed or skipped declared dependency is skipped
//!   without being attempted; overlap edges only order, they never skip

use crate::report::RuleOutcome;
use curation_core::RuleId;
use curation_plan::ExecutionOrder;
use indexmap::IndexMap;

/// Scheduling decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Start this rule
    Run(RuleId),
    /// Record this rule as skipped
    Skip {
        /// Rule to skip
        rule: RuleId,
        /// Declared dependencies that did not complete
        failed_dependencies: Vec<RuleId>,
    },
    /// Nothing can start until a running rule settles
    Wait,
    /// Every rule has settled
    Complete,
}

/// Terminal state of a rule as far as scheduling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// DONE
    Done,
    /// FAILED
    Failed,
    /// SKIPPED_DEPENDENCY_FAILED
    Skipped,
    /// NOT_APPLICABLE
    NotApplicable,
    /// CANCELLED
    Cancelled,
}

impl Settled {
    /// Whether declared dependents must be skipped
    #[must_use]
    pub const fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

impl From<&RuleOutcome> for Settled {
    fn from(outcome: &RuleOutcome) -> Self {
        match outcome {
            RuleOutcome::Done { .. } => Self::Done,
            RuleOutcome::Failed { .. } => Self::Failed,
            RuleOutcome::SkippedDependencyFailed { .. } => Self::Skipped,
            RuleOutcome::NotApplicable { .. } => Self::NotApplicable,
            RuleOutcome::Cancelled { .. } => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Settled(Settled),
}

/// Hands out rules of an execution order
pub struct Scheduler {
    /// Rule -> state, in execution order
    slots: IndexMap<RuleId, Slot>,
    /// Rule -> every rule that must settle first
    predecessors: IndexMap<RuleId, Vec<RuleId>>,
    /// Rule -> rules it declares in `depends_on`
    declared: IndexMap<RuleId, Vec<RuleId>>,
}

impl Scheduler {
    /// Create a scheduler over a resolved order
    #[must_use]
    pub fn new(order: &ExecutionOrder) -> Self {
        let graph = order.graph();
        let mut slots = IndexMap::new();
        let mut predecessors = IndexMap::new();
        let mut declared = IndexMap::new();
        for id in order.ids() {
            slots.insert(id.clone(), Slot::Pending);
            predecessors.insert(id.clone(), graph.dependencies(id));
            declared.insert(id.clone(), graph.declared_dependencies(id));
        }
        Self {
            slots,
            predecessors,
            declared,
        }
    }

    fn settled(&self, id: &RuleId) -> Option<Settled> {
        match self.slots.get(id) {
            Some(Slot::Settled(s)) => Some(*s),
            _ => None,
        }
    }

    /// Next decision
    ///
    /// Deterministic: the same sequence of marks always yields the same
    /// decisions.
    #[must_use]
    pub fn decide(&self) -> ScheduleDecision {
        let mut unsettled = false;
        for (id, slot) in &self.slots {
            match slot {
                Slot::Settled(_) => continue,
                Slot::Running => {
                    unsettled = true;
                    continue;
                }
                Slot::Pending => unsettled = true,
            }

            let failed_dependencies: Vec<RuleId> = self
                .declared
                .get(id)
                .into_iter()
                .flatten()
                .filter(|dep| self.settled(dep).is_some_and(|s| s.blocks_dependents()))
                .cloned()
                .collect();
            if !failed_dependencies.is_empty() {
                return ScheduleDecision::Skip {
                    rule: id.clone(),
                    failed_dependencies,
                };
            }

            let ready = self
                .predecessors
                .get(id)
                .into_iter()
                .flatten()
                .all(|pred| matches!(self.settled(pred), Some(s) if s != Settled::Cancelled));
            if ready {
                return ScheduleDecision::Run(id.clone());
            }
        }

        if unsettled {
            ScheduleDecision::Wait
        } else {
            ScheduleDecision::Complete
        }
    }

    /// Record that a rule started
    pub fn mark_started(&mut self, id: &RuleId) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = Slot::Running;
        }
    }

    /// Record a rule's terminal state
    pub fn mark_settled(&mut self, id: &RuleId, settled: Settled) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = Slot::Settled(settled);
        }
    }

    /// Settle every rule that has not started as cancelled
    ///
    /// Returns the affected rules in execution order.
    pub fn cancel_pending(&mut self) -> Vec<RuleId> {
        let mut cancelled = Vec::new();
        for (id, slot) in &mut self.slots {
            if *slot == Slot::Pending {
                *slot = Slot::Settled(Settled::Cancelled);
                cancelled.push(id.clone());
            }
        }
        cancelled
    }

    /// Rules currently running
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.slots.values().filter(|s| **s == Slot::Running).count()
    }

    /// Rules that have settled
    #[must_use]
    pub fn settled_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Settled(_)))
            .count()
    }

    /// Whether every rule has settled
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.settled_count() == self.slots.len()
    }

    /// Whether any rule failed
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.slots
            .values()
            .any(|s| *s == Slot::Settled(Settled::Failed))
    }
}
