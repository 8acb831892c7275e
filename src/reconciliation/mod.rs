//! Reconciliation layer: attach the best catalog suggestion, alternatives,
//! and discrepancy flags to every extracted line.

pub mod discrepancy;
pub mod orders;
pub mod parts;
pub mod ranker;
pub mod shopping;

use tracing::warn;
use uuid::Uuid;

use crate::db::{CatalogRepository, OrdersRepository};
use crate::error::PipelineError;
use crate::models::{Discrepancy, ExtractedLine, SuggestedMatch};

/// One reconciled line: the extraction plus whatever the catalog knows.
#[derive(Debug, Clone)]
pub struct ReconciledLine {
    pub line: ExtractedLine,
    pub suggested_part: Option<SuggestedMatch>,
    pub discrepancy: Option<Discrepancy>,
}

pub struct Reconciler<'a> {
    catalog: &'a dyn CatalogRepository,
    orders: &'a dyn OrdersRepository,
}

impl<'a> Reconciler<'a> {
    pub fn new(catalog: &'a dyn CatalogRepository, orders: &'a dyn OrdersRepository) -> Self {
        Self { catalog, orders }
    }

    /// Reconcile a batch of extracted lines for one tenant. Signal lookups
    /// are best-effort: a failed shopping-list or order read downgrades the
    /// suggestion instead of failing the line.
    pub fn reconcile(
        &self,
        yacht_id: Uuid,
        lines: Vec<ExtractedLine>,
    ) -> Result<Vec<ReconciledLine>, PipelineError> {
        let matcher = parts::PartMatcher::new(self.catalog);
        let mut reconciled = Vec::with_capacity(lines.len());

        for line in lines {
            let candidates =
                matcher.find_matches(yacht_id, &line.description, line.part_number.as_deref())?;

            let (shopping, recent) = match candidates.first() {
                Some(best) => {
                    let shopping = shopping::check_shopping_list_match(
                        self.orders,
                        yacht_id,
                        best.part.id,
                        line.quantity,
                    )
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Shopping list lookup failed");
                        None
                    });
                    let recent = orders::find_recent_orders(self.orders, yacht_id, best.part.id)
                        .unwrap_or_else(|e| {
                            warn!(error = %e, "Recent order lookup failed");
                            Vec::new()
                        });
                    (shopping, recent)
                }
                None => (None, Vec::new()),
            };

            let ordered_quantity = recent.first().map(|o| o.quantity_ordered);
            let suggested_part = ranker::rank_suggestions(&candidates, shopping, recent);

            // A known ordered quantity lets us flag short or over deliveries
            // right on the draft line.
            let discrepancy =
                ordered_quantity.and_then(|expected| discrepancy::detect(expected, line.quantity));

            reconciled.push(ReconciledLine { line, suggested_part, discrepancy });
        }

        Ok(reconciled)
    }
}
