//! Planner: turns the candidate stream into an ordered plan.
//!
//! Policy and scan-time safety run here for every candidate, but nothing
//! is filtered out: denied items travel on to the executor so the final
//! audit records them.

use crossbeam_channel::Receiver;

use crate::core::types::{Candidate, EnvSnapshot, PlanItem};
use crate::policy::Policy;
use crate::safety::SafetyValidator;

/// Builds plans from candidate streams.
pub struct Planner<'a> {
    policy: &'a dyn Policy,
    safety: &'a SafetyValidator,
}

impl<'a> Planner<'a> {
    #[must_use]
    pub fn new(policy: &'a dyn Policy, safety: &'a SafetyValidator) -> Self {
        Self { policy, safety }
    }

    /// Consume the candidate sequence and produce plan items ordered by
    /// score descending (stable for ties, so scanner order is preserved).
    #[must_use]
    pub fn plan(&self, candidates: Receiver<Candidate>, env: &EnvSnapshot) -> Vec<PlanItem> {
        let mut items: Vec<PlanItem> = candidates
            .iter()
            .map(|candidate| {
                let decision = self.policy.evaluate(&candidate, env);
                let safety = self.safety.validate(&candidate);
                PlanItem {
                    candidate,
                    decision,
                    safety,
                }
            })
            .collect();
        items.sort_by(|a, b| b.decision.score.cmp(&a.decision.score));
        items
    }
}
