//! Pending plans keyed by conversation id.

use std::collections::HashMap;
use std::sync::Mutex;

use super::planner::PendingPlan;

#[derive(Default)]
pub struct PendingPlanStore {
    plans: Mutex<HashMap<String, PendingPlan>>,
}

impl PendingPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any plan already stashed for this conversation.
    pub fn stash(&self, conversation_id: &str, plan: PendingPlan) {
        if let Ok(mut plans) = self.plans.lock() {
            plans.insert(conversation_id.to_string(), plan);
        }
    }

    /// Remove and return the stashed plan. A plan is consumed exactly once.
    pub fn take(&self, conversation_id: &str) -> Option<PendingPlan> {
        self.plans.lock().ok()?.remove(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.plans.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::planner::Plan;
    use serde_json::json;

    #[test]
    fn test_take_consumes_once() {
        let store = PendingPlanStore::new();
        let pending = PendingPlan {
            plan: Plan {
                refined_task: "t".to_string(),
                priority_order: vec![],
                extracted_context: json!({}),
                instructions: Default::default(),
            },
            remainder: vec![],
            question: "q".to_string(),
            options: vec![],
            trail: vec![],
        };
        store.stash("c1", pending.clone());
        assert_eq!(store.len(), 1);
        assert_eq!(store.take("c1"), Some(pending));
        assert!(store.take("c1").is_none());
        assert!(store.is_empty());
    }
}
