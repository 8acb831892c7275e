//! Extraction layer: OCR text in, structured line items out, with the
//! minimum LLM spend the cost controller will allow.

pub mod classifier;
pub mod cost;
pub mod entities;
pub mod llm;
pub mod rows;
pub mod table;

use tracing::{info, warn};

use crate::config::Config;
use crate::models::{DocumentClassification, DocumentKind, ExtractedLine, Provenance};
use crate::ocr::OcrResult;

use cost::{Action, CostController, SessionCostTracker};
use entities::PackingSlipEntities;
use llm::{LlmClient, LlmNormalizer};
use table::TableDetection;

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub classification: DocumentClassification,
    pub entities: Option<PackingSlipEntities>,
    pub table: TableDetection,
    pub lines: Vec<ExtractedLine>,
    pub coverage: f64,
    pub primary_method: Provenance,
    pub llm_calls: u32,
    pub total_cost: f64,
    pub manual_review_required: bool,
    pub decision_reason: &'static str,
}

/// Run the extraction pipeline over one OCR result. Classification, table
/// detection and deterministic parsing always happen; the LLM loop runs only
/// while the cost controller keeps approving spend.
pub async fn extract(
    config: &Config,
    llm_client: Option<&dyn LlmClient>,
    tracker: &mut SessionCostTracker,
    ocr: &OcrResult,
) -> ExtractionOutcome {
    let classification = classifier::classify(&ocr.text);
    let entities = (classification.kind == DocumentKind::PackingList)
        .then(|| entities::extract_packing_slip_entities(&ocr.text));
    let table = table::detect_table(ocr);
    let parse = rows::parse_lines(&ocr.text);

    let controller = CostController::new(config);
    let mut llm_attempts = 0u32;
    let mut last_confidence: Option<f64> = None;
    let mut llm_lines: Option<Vec<ExtractedLine>> = None;
    let mut manual_review_required = false;
    let mut decision_reason;

    loop {
        let decision = controller.decide_next_action(
            tracker,
            parse.coverage,
            table.confidence,
            llm_attempts,
            last_confidence,
        );
        decision_reason = decision.reason;

        match decision.action {
            Action::ReturnResults => break,
            Action::ReturnPartial { manual_review_required: manual } => {
                manual_review_required = manual;
                break;
            }
            Action::InvokeLlm { model, max_tokens, temperature } => {
                let Some(client) = llm_client else {
                    warn!("LLM invocation approved but no client configured");
                    manual_review_required = true;
                    decision_reason = "no_llm_client";
                    break;
                };
                let normalizer = LlmNormalizer::new(config, client);
                match normalizer
                    .normalize(tracker, &ocr.text, &model, max_tokens, temperature)
                    .await
                {
                    Ok(result) => {
                        llm_attempts += 1;
                        let confident = result.confidence >= 0.6;
                        last_confidence = Some(result.confidence);
                        llm_lines = Some(result.lines);
                        // A convincing LLM pass ends the loop; a weak one
                        // goes back to the controller for escalation.
                        if confident {
                            decision_reason = "llm_success";
                            break;
                        }
                    }
                    Err(e) => {
                        // Retries are already spent inside the normalizer;
                        // deliver the best partial rather than failing.
                        warn!(error = %e, "LLM normalization failed, flagging manual review");
                        manual_review_required = true;
                        decision_reason = "llm_failed";
                        break;
                    }
                }
            }
        }
    }

    let (lines, primary_method) = match llm_lines {
        Some(lines) if !lines.is_empty() => (lines, Provenance::Llm),
        _ => (parse.lines, Provenance::Regex),
    };

    info!(
        kind = classification.kind.as_str(),
        lines = lines.len(),
        coverage = parse.coverage,
        method = primary_method.as_str(),
        llm_calls = tracker.llm_calls,
        cost = tracker.total_cost,
        manual_review = manual_review_required,
        "📄 Extraction complete"
    );

    ExtractionOutcome {
        classification,
        entities,
        table,
        lines,
        coverage: parse.coverage,
        primary_method,
        llm_calls: tracker.llm_calls,
        total_cost: tracker.total_cost,
        manual_review_required,
        decision_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llm::{LlmCompletion, LlmError, LlmRequest};
    use serde_json::json;
    use uuid::Uuid;

    struct FixedClient {
        content: String,
        fail: bool,
    }

    #[async_trait]
    impl LlmClient for FixedClient {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmCompletion, LlmError> {
            if self.fail {
                return Err(LlmError::Fatal("boom".into()));
            }
            Ok(LlmCompletion {
                content: self.content.clone(),
                input_tokens: 1000,
                output_tokens: 400,
            })
        }
    }

    fn ocr(text: &str) -> OcrResult {
        OcrResult {
            text: text.into(),
            confidence: 0.9,
            fragments: Vec::new(),
            engine: "test".into(),
            processing_time_ms: 5,
            metadata: json!({}),
        }
    }

    const CLEAN_SLIP: &str = "12 ea MTU Oil Filter MTU-OF-4568\n\
                              3 box Exhaust Gasket Set EGS-2210\n\
                              7 ea Coolant Hose Clamp CHC-0091\n\
                              2 pcs Impeller Service Kit ISK-4432";

    #[tokio::test]
    async fn test_clean_document_spends_nothing() {
        let config = Config::from_env();
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());
        let outcome = extract(&config, None, &mut tracker, &ocr(CLEAN_SLIP)).await;

        assert_eq!(outcome.lines.len(), 4);
        assert_eq!(outcome.primary_method, Provenance::Regex);
        assert_eq!(outcome.llm_calls, 0);
        assert_eq!(outcome.total_cost, 0.0);
        assert_eq!(outcome.decision_reason, "deterministic_success");
        assert!(!outcome.manual_review_required);
    }

    #[tokio::test]
    async fn test_messy_document_escalates_to_llm() {
        let config = Config::from_env();
        let client = FixedClient {
            content: r#"{"lines": [
                {"quantity": 12, "unit": "ea", "description": "MTU Oil Filter", "part_number": "MTU-OF-4568", "confidence": "high"}
            ], "extraction_notes": ""}"#
                .into(),
            fail: false,
        };
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());
        // Garbled text: nothing parses deterministically.
        let outcome = extract(
            &config,
            Some(&client),
            &mut tracker,
            &ocr("@@garbled@@\n##noise##\nunparseable content here\nmore noise lines\nstill nothing"),
        )
        .await;

        assert_eq!(outcome.primary_method, Provenance::Llm);
        assert_eq!(outcome.lines.len(), 1);
        assert_eq!(outcome.llm_calls, 1);
        assert!(outcome.total_cost > 0.0);
        assert_eq!(outcome.decision_reason, "llm_success");
        assert!(!outcome.manual_review_required);
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_to_partial() {
        let config = Config::from_env();
        let client = FixedClient { content: String::new(), fail: true };
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());
        let outcome = extract(
            &config,
            Some(&client),
            &mut tracker,
            &ocr("@@garbled@@\n##noise##\nunparseable content here"),
        )
        .await;

        assert!(outcome.manual_review_required);
        assert_eq!(outcome.decision_reason, "llm_failed");
        assert_eq!(outcome.primary_method, Provenance::Regex);
    }

    #[tokio::test]
    async fn test_no_client_flags_manual_review() {
        let config = Config::from_env();
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());
        let outcome = extract(
            &config,
            None,
            &mut tracker,
            &ocr("@@garbled@@\n##noise##\nunparseable content here"),
        )
        .await;
        assert!(outcome.manual_review_required);
        assert_eq!(outcome.decision_reason, "no_llm_client");
    }

    #[tokio::test]
    async fn test_packing_slip_entities_attached() {
        let config = Config::from_env();
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());
        let text = format!(
            "PACKING SLIP\nShip To: MY Excellence\nCarrier: UPS\nOrder Number: ORD-2024-042\n{CLEAN_SLIP}"
        );
        let outcome = extract(&config, None, &mut tracker, &ocr(&text)).await;
        assert_eq!(outcome.classification.kind, DocumentKind::PackingList);
        let entities = outcome.entities.unwrap();
        assert_eq!(entities.order_number.as_deref(), Some("ORD-2024-042"));
    }
}
