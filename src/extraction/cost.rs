//! Session-scoped LLM cost tracking and the escalation state machine.
//!
//! The controller is a small policy over (coverage, table confidence,
//! attempts, last confidence, budget): accept deterministic results, try the
//! mini model once, escalate once on low confidence, otherwise give up and
//! flag for manual review. Budgets are hard caps.

use std::collections::HashMap;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;

/// Escalation decision table confidence floor for accepting deterministic
/// results without any LLM spend.
const ACCEPT_TABLE_CONFIDENCE: f64 = 0.7;
/// Last-attempt confidence below which the large model is consulted.
const ESCALATE_CONFIDENCE: f64 = 0.6;
/// Fraction of the cost cap that triggers the budget warning.
const BUDGET_WARN_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Default)]
struct ModelUsage {
    calls: u32,
    tokens: u64,
    cost: f64,
}

/// Running LLM spend for one extraction session. Owned by the orchestrator
/// task; never shared.
#[derive(Debug)]
pub struct SessionCostTracker {
    pub session_id: Uuid,
    pub llm_calls: u32,
    pub total_tokens: u64,
    pub total_cost: f64,
    model_usage: HashMap<String, ModelUsage>,
    warned: bool,
}

impl SessionCostTracker {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            llm_calls: 0,
            total_tokens: 0,
            total_cost: 0.0,
            model_usage: HashMap::new(),
            warned: false,
        }
    }

    pub fn record_llm_call(
        &mut self,
        config: &Config,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
    ) {
        self.llm_calls += 1;
        self.total_tokens += (input_tokens + output_tokens) as u64;
        self.total_cost += cost;

        let usage = self.model_usage.entry(model.to_string()).or_default();
        usage.calls += 1;
        usage.tokens += (input_tokens + output_tokens) as u64;
        usage.cost += cost;

        info!(
            session_id = %self.session_id,
            model,
            input_tokens,
            output_tokens,
            cost,
            total_cost = self.total_cost,
            total_calls = self.llm_calls,
            "LLM call recorded"
        );

        if !self.warned && self.total_cost > config.max_cost_per_session * BUDGET_WARN_RATIO {
            self.warned = true;
            warn!(
                session_id = %self.session_id,
                total_cost = self.total_cost,
                cap = config.max_cost_per_session,
                percentage = self.total_cost / config.max_cost_per_session * 100.0,
                "💸 Session approaching cost cap"
            );
        }
    }

    /// Projected affordability of one more call. Tokens split 60/40 between
    /// input and output for the estimate.
    pub fn can_afford_call(&self, config: &Config, model: &str, estimated_tokens: u32) -> bool {
        let estimated_input = (estimated_tokens as f64 * 0.6) as u32;
        let estimated_output = (estimated_tokens as f64 * 0.4) as u32;
        let estimated_cost = config.llm_cost(model, estimated_input, estimated_output);

        if self.total_cost + estimated_cost > config.max_cost_per_session {
            warn!(
                session_id = %self.session_id,
                projected_cost = self.total_cost + estimated_cost,
                cap = config.max_cost_per_session,
                "Cannot afford LLM call, cost budget"
            );
            return false;
        }
        if self.llm_calls + 1 > config.max_llm_calls_per_session {
            warn!(
                session_id = %self.session_id,
                projected_calls = self.llm_calls + 1,
                cap = config.max_llm_calls_per_session,
                "Cannot afford LLM call, call budget"
            );
            return false;
        }
        true
    }

    /// Per-model breakdown as (model, calls, tokens, cost) tuples.
    pub fn breakdown(&self) -> Vec<(String, u32, u64, f64)> {
        let mut rows: Vec<_> = self
            .model_usage
            .iter()
            .map(|(model, u)| (model.clone(), u.calls, u.tokens, u.cost))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

/// What the extraction loop should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Deterministic results are good enough; stop here.
    ReturnResults,
    /// Spend an LLM call with these parameters.
    InvokeLlm { model: String, max_tokens: u32, temperature: f64 },
    /// Stop with what we have; a human has to look at it.
    ReturnPartial { manual_review_required: bool },
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub reason: &'static str,
}

pub struct CostController<'a> {
    config: &'a Config,
}

impl<'a> CostController<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn decide_next_action(
        &self,
        tracker: &SessionCostTracker,
        coverage: f64,
        table_confidence: f64,
        llm_attempts: u32,
        last_llm_confidence: Option<f64>,
    ) -> Decision {
        // Deterministic success needs no spend at all.
        if coverage >= self.config.llm_coverage_threshold
            && table_confidence >= ACCEPT_TABLE_CONFIDENCE
        {
            return Decision { action: Action::ReturnResults, reason: "deterministic_success" };
        }

        if tracker.llm_calls >= self.config.max_llm_calls_per_session {
            return Decision {
                action: Action::ReturnPartial { manual_review_required: true },
                reason: "llm_budget_exceeded",
            };
        }
        if tracker.total_cost >= self.config.max_cost_per_session {
            return Decision {
                action: Action::ReturnPartial { manual_review_required: true },
                reason: "cost_budget_exceeded",
            };
        }

        if llm_attempts == 0 {
            let model = self.config.llm_normalization_model.clone();
            if !tracker.can_afford_call(self.config, &model, 2000) {
                return Decision {
                    action: Action::ReturnPartial { manual_review_required: true },
                    reason: "cannot_afford_normalization",
                };
            }
            return Decision {
                action: Action::InvokeLlm { model, max_tokens: 2000, temperature: 0.1 },
                reason: "low_coverage",
            };
        }

        if llm_attempts == 1
            && last_llm_confidence.is_some_and(|c| c < ESCALATE_CONFIDENCE)
        {
            if !self.config.enable_llm_escalation {
                return Decision {
                    action: Action::ReturnPartial { manual_review_required: true },
                    reason: "escalation_disabled",
                };
            }
            let model = self.config.llm_escalation_model.clone();
            if !tracker.can_afford_call(self.config, &model, 3000) {
                return Decision {
                    action: Action::ReturnPartial { manual_review_required: true },
                    reason: "cannot_afford_escalation",
                };
            }
            return Decision {
                action: Action::InvokeLlm { model, max_tokens: 3000, temperature: 0.2 },
                reason: "escalation_low_confidence",
            };
        }

        Decision {
            action: Action::ReturnPartial { manual_review_required: true },
            reason: "max_attempts_reached",
        }
    }
}
