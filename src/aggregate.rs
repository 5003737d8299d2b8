//! Fan-out and aggregation for one page.
//!
//! ```text
//!            ┌─▶ provider A ─┐
//!   page ────┼─▶ provider B ─┼──▶ 0 ok: PageError
//!            └─▶ provider C ─┘    1 ok: passthrough
//!                                 n ok: aggregator.synthesize ──fail──▶ first candidate (degraded)
//! ```
//!
//! Provider calls for a page run concurrently; `join_all` keeps the results
//! in active-set order, so the candidate list and therefore the synthesis
//! prompt are deterministic for identical provider outputs.
//!
//! The final text is written to the memory index before this returns. The
//! write happens after every provider call for the page has finished, so no
//! tool lookup can see the page's own chunks.

use crate::error::PageError;
use crate::memory::MemoryIndex;
use crate::output::{AggregatedResult, ExtractionRecord, ResultStatus};
use crate::progress::ExtractionProgressCallback;
use crate::prompts;
use crate::provider::{ExtractionRequest, ProviderSet};
use crate::tools::ToolBox;
use futures::future::join_all;
use tracing::{debug, info, warn};

/// Produce exactly one result for `request.page`, or the page-level error
/// when no provider succeeded.
pub async fn fan_out_and_aggregate(
    request: &ExtractionRequest<'_>,
    providers: &ProviderSet,
    tools: &ToolBox<'_>,
    memory: Option<&MemoryIndex>,
    progress: Option<&dyn ExtractionProgressCallback>,
) -> Result<AggregatedResult, PageError> {
    let page_number = request.page.page_number;
    let active = providers.active();

    let outcomes = join_all(active.iter().map(|p| p.extract(request, tools))).await;

    let mut candidates: Vec<ExtractionRecord> = Vec::with_capacity(active.len());
    let mut failures: Vec<String> = Vec::new();
    for (provider, outcome) in active.iter().zip(outcomes) {
        let ok = outcome.is_ok();
        match outcome {
            Ok(text) => candidates.push(ExtractionRecord {
                provider_id: provider.id().to_string(),
                text,
                page_number,
            }),
            Err(e) => {
                warn!("Page {}: provider {} failed: {}", page_number, provider.id(), e);
                failures.push(format!("{}: {}", provider.id(), e));
            }
        }
        if let Some(cb) = progress {
            cb.on_provider_result(page_number, provider.id(), ok);
        }
    }

    let result = match candidates.len() {
        0 => {
            return Err(PageError::AllProvidersFailed {
                page: page_number,
                attempted: active.len(),
                failures,
            })
        }
        1 => {
            debug!("Page {}: single candidate, passthrough", page_number);
            let only = candidates.remove(0);
            AggregatedResult {
                page_number,
                text: only.text,
                source_count: 1,
                contributors: vec![only.provider_id],
                status: ResultStatus::Passthrough,
            }
        }
        n => synthesize(providers, candidates, n).await,
    };

    if let Some(memory) = memory {
        match memory.record_extraction(&result.text, page_number).await {
            Ok(added) => debug!("Page {}: {} memory chunks", page_number, added),
            Err(e) => warn!("Page {}: memory index not updated: {}", page_number, e),
        }
    }

    Ok(result)
}

async fn synthesize(
    providers: &ProviderSet,
    candidates: Vec<ExtractionRecord>,
    n: usize,
) -> AggregatedResult {
    let page_number = candidates[0].page_number;
    let contributors: Vec<String> = candidates.iter().map(|c| c.provider_id.clone()).collect();
    let prompt = prompts::synthesis_prompt(page_number, &candidates);
    let aggregator = providers.aggregator();

    match aggregator.synthesize(&candidates, &prompt).await {
        Ok(text) => {
            info!(
                "Page {}: merged {} extractions with {}",
                page_number,
                n,
                aggregator.id()
            );
            AggregatedResult {
                page_number,
                text,
                source_count: n,
                contributors,
                status: ResultStatus::Synthesized,
            }
        }
        Err(e) => {
            warn!(
                "Page {}: aggregation degraded, keeping {}'s extraction: {}",
                page_number, contributors[0], e
            );
            let first = candidates.into_iter().next().map(|c| c.text).unwrap_or_default();
            AggregatedResult {
                page_number,
                text: first,
                source_count: n,
                contributors,
                status: ResultStatus::Degraded {
                    reason: e.to_string(),
                },
            }
        }
    }
}
