//! Run entry points and the stage graph.
//!
//! ```text
//! Load ──▶ SelectPage ──▶ Extract ──▶ CheckComplete ──not complete──▶ SelectPage
//!              │                           │
//!              └──── complete ────▶ Export ◀┘ complete
//!                                     │
//!                                    Done
//! ```
//!
//! * **Load**: restore a checkpoint when resuming and replay its results into
//!   the memory index.
//! * **SelectPage**: [`advance`] picks the next page by position.
//! * **Extract**: fan out, aggregate, record the result (a placeholder when
//!   every provider failed) and checkpoint.
//! * **CheckComplete**: [`check_complete`] compares result and page counts.
//! * **Export**: always runs, also after an anomaly, so partial work is kept.
//!
//! Pages are processed strictly one at a time: each prompt quotes the
//! previous pages' results, and the traversal state has a single writer.
//! Every stage transition is counted; a run that exceeds
//! `max_stage_steps` is aborted and exported as it stands.

pub mod checkpoint;

use crate::aggregate::fan_out_and_aggregate;
use crate::config::PipelineConfig;
use crate::error::PharmDeckError;
use crate::export::{self, export_prefix};
use crate::memory::{resolve_embedder, MemoryIndex};
use crate::output::{
    AggregatedResult, Document, DocumentMetadata, Page, RunOutput, RunStats, RunStatus,
    TraversalAnomaly,
};
use crate::pipeline;
use crate::progress::ExtractionProgressCallback;
use crate::prompts::{self, PriorPage};
use crate::provider::{ExtractionRequest, ProviderSet};
use crate::tools::{SchemaCatalog, SearchCapability, TavilySearch, ToolBox};
use crate::traversal::{advance, check_complete, TraversalState};
use checkpoint::Checkpoint;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Placeholder for metadata nobody supplied.
pub const NOT_PROVIDED: &str = "Not provided";

/// Stages of the run graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    SelectPage,
    Extract,
    CheckComplete,
    Export,
    Done,
}

/// Extract a PDF file or URL end to end.
///
/// Returns `Ok` whenever the document could be loaded and the export
/// handled, even if pages failed; check `output.status` and
/// `output.stats.failed_pages`.
///
/// # Errors
/// Only fatal conditions: unreadable input, no provider configured, an
/// unreadable checkpoint, or a failed export write.
pub async fn run(input: impl AsRef<str>, config: &PipelineConfig) -> Result<RunOutput, PharmDeckError> {
    let input = input.as_ref();
    info!("Starting extraction: {}", input);
    let document = pipeline::load(input, config).await?;
    run_document(document, config).await
}

/// Synchronous wrapper around [`run`].
pub fn run_sync(input: impl AsRef<str>, config: &PipelineConfig) -> Result<RunOutput, PharmDeckError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PharmDeckError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run(input, config))
}

/// Document metadata without rendering pages or configuring a provider.
pub async fn inspect(
    input: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<DocumentMetadata, PharmDeckError> {
    let mut metadata = pipeline::inspect(input.as_ref(), config).await?;
    apply_overrides(&mut metadata, config);
    Ok(metadata)
}

/// Run the stage graph over an already loaded document.
///
/// This is the seam for callers with their own document source, and for
/// tests that drive the pipeline with in-memory pages.
pub async fn run_document(
    document: Document,
    config: &PipelineConfig,
) -> Result<RunOutput, PharmDeckError> {
    let started = Instant::now();
    let Document {
        mut metadata,
        pages,
    } = document;
    metadata.page_count = pages.len();
    apply_overrides(&mut metadata, config);

    let providers = ProviderSet::resolve(config)?;
    let memory = MemoryIndex::new(resolve_embedder(config), config.memory_top_k);
    let search = resolve_search(config);
    let schema = resolve_schema(config);
    let tools = if config.enable_tools {
        ToolBox::new(Some(&memory), search.as_deref(), schema.as_ref())
    } else {
        ToolBox::none()
    };
    debug!("Tools on offer: {:?}", tools.names());

    let prefix = export_prefix(&metadata.document_id);
    let checkpoint_path = match (&config.output_dir, config.checkpoint) {
        (Some(dir), true) => Some(checkpoint::checkpoint_path(dir, &prefix)),
        _ => None,
    };
    let progress = config.progress_callback.as_deref();

    let ctx = RunContext {
        config,
        metadata: &metadata,
        providers: &providers,
        memory: &memory,
        tools,
        checkpoint_path: checkpoint_path.clone(),
        progress,
    };

    let total = pages.len();
    let mut state = TraversalState::new(pages);
    let mut resumed_pages = 0usize;
    let mut stage = Stage::Load;
    let mut steps = 0usize;

    loop {
        if !matches!(stage, Stage::Export | Stage::Done) {
            steps += 1;
            if steps > config.max_stage_steps {
                state = state.abort(TraversalAnomaly::StepLimitExceeded {
                    limit: config.max_stage_steps,
                });
                stage = Stage::Export;
            }
        }
        debug!("stage {:?} (step {})", stage, steps);

        stage = match stage {
            Stage::Load => {
                if config.resume {
                    (state, resumed_pages) = ctx.restore(state).await?;
                }
                if let Some(cb) = progress {
                    cb.on_run_start(total, resumed_pages);
                }
                Stage::SelectPage
            }
            Stage::SelectPage => {
                state = advance(state);
                if state.is_complete() {
                    Stage::Export
                } else {
                    Stage::Extract
                }
            }
            Stage::Extract => {
                let result = match state.current_page() {
                    Some(page) => ctx.extract_page(page, state.results(), total).await,
                    None => {
                        let missing = state.current_page_number().unwrap_or_default();
                        state = state.abort(TraversalAnomaly::PageNotFound {
                            page_number: missing,
                        });
                        stage = Stage::Export;
                        continue;
                    }
                };
                state = state.record(result);
                ctx.save_checkpoint(&state).await;
                Stage::CheckComplete
            }
            Stage::CheckComplete => {
                state = check_complete(state);
                if state.is_complete() {
                    Stage::Export
                } else {
                    Stage::SelectPage
                }
            }
            Stage::Export | Stage::Done => break,
        };
    }

    // ── Export ───────────────────────────────────────────────────────────
    let warnings = collect_warnings(&state);
    let status = match state.anomaly() {
        Some(anomaly) => RunStatus::Aborted {
            anomaly: anomaly.clone(),
        },
        None if warnings.is_empty() => RunStatus::Complete,
        None => RunStatus::CompleteWithWarnings { warnings },
    };

    let mut results = state.into_results();
    results.sort_by_key(|r| r.page_number);

    let output_dir = config.output_dir.as_deref();
    let (export_text, export_outcome) = export::export(&results, &prefix, output_dir).await?;

    if let Some(ref path) = checkpoint_path {
        if !matches!(status, RunStatus::Aborted { .. }) {
            checkpoint::remove(path).await;
        }
    }

    let processed = results.iter().filter(|r| !r.is_failed()).count();
    let stats = RunStats {
        total_pages: total,
        processed_pages: processed,
        failed_pages: results.iter().filter(|r| r.is_failed()).count(),
        degraded_pages: results.iter().filter(|r| r.is_degraded()).count(),
        resumed_pages,
        memory_chunks: memory.len().await,
        total_duration_ms: started.elapsed().as_millis() as u64,
    };

    if let Some(cb) = progress {
        cb.on_run_complete(total, processed);
    }
    info!(
        "Extraction finished: {}/{} pages, {} failed, {} degraded, {}ms",
        processed, total, stats.failed_pages, stats.degraded_pages, stats.total_duration_ms
    );

    Ok(RunOutput {
        metadata,
        results,
        export: export_text,
        export_outcome,
        status,
        stats,
    })
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Everything the stages share for one run.
struct RunContext<'a> {
    config: &'a PipelineConfig,
    metadata: &'a DocumentMetadata,
    providers: &'a ProviderSet,
    memory: &'a MemoryIndex,
    tools: ToolBox<'a>,
    checkpoint_path: Option<PathBuf>,
    progress: Option<&'a dyn ExtractionProgressCallback>,
}

impl RunContext<'_> {
    /// Produce the result for one page; a placeholder when every provider
    /// failed.
    async fn extract_page(
        &self,
        page: &Page,
        prior_results: &[AggregatedResult],
        total: usize,
    ) -> AggregatedResult {
        let page_number = page.page_number;
        if let Some(cb) = self.progress {
            cb.on_page_start(page_number, total);
        }

        let prior = rolling_context(prior_results, self.config.context_window);
        let user_prompt =
            prompts::extraction_user_prompt(self.metadata, page_number, total, &prior);
        let request = ExtractionRequest {
            page,
            system_prompt: prompts::EXTRACTION_SYSTEM_PROMPT,
            user_prompt: &user_prompt,
        };

        match fan_out_and_aggregate(
            &request,
            self.providers,
            &self.tools,
            Some(self.memory),
            self.progress,
        )
        .await
        {
            Ok(result) => {
                if let Some(cb) = self.progress {
                    cb.on_page_complete(page_number, total, result.source_count);
                }
                result
            }
            Err(e) => {
                error!("{}", e);
                if let Some(cb) = self.progress {
                    cb.on_page_error(page_number, total, &e.to_string());
                }
                AggregatedResult::failed(page_number, e)
            }
        }
    }

    /// Apply a matching checkpoint. Returns the new state and the number of
    /// restored pages.
    async fn restore(
        &self,
        state: TraversalState,
    ) -> Result<(TraversalState, usize), PharmDeckError> {
        let Some(ref path) = self.checkpoint_path else {
            return Ok((state, 0));
        };
        let Some(cp) = checkpoint::load(path).await? else {
            info!("No checkpoint at {}, starting fresh", path.display());
            return Ok((state, 0));
        };
        let total = state.pages().len();
        if !cp.matches(&self.metadata.document_id, total) {
            warn!(
                "Ignoring checkpoint {}: taken for '{}' with {} pages",
                path.display(),
                cp.document_id,
                cp.page_count
            );
            return Ok((state, 0));
        }
        let page_numbers: Vec<usize> = state.pages().iter().map(|p| p.page_number).collect();
        if !cp.is_consistent(&page_numbers) {
            warn!(
                "Ignoring checkpoint {}: position {:?} disagrees with {} saved results",
                path.display(),
                cp.current_page,
                cp.results.len()
            );
            return Ok((state, 0));
        }

        let mut replay: Vec<&AggregatedResult> =
            cp.results.iter().filter(|r| !r.is_failed()).collect();
        replay.sort_by_key(|r| r.page_number);
        for r in replay {
            if let Err(e) = self.memory.record_extraction(&r.text, r.page_number).await {
                warn!("Page {}: memory not restored: {}", r.page_number, e);
            }
        }
        let restored = cp.results.len();
        info!(
            "Resuming from checkpoint saved {}: {} of {} pages done",
            cp.saved_at, restored, total
        );

        let pages = state.pages().to_vec();
        Ok((
            TraversalState::resume(pages, cp.results, cp.current_page),
            restored,
        ))
    }

    /// Checkpoint failures only cost resumability, never the run.
    async fn save_checkpoint(&self, state: &TraversalState) {
        let Some(ref path) = self.checkpoint_path else {
            return;
        };
        let cp = Checkpoint::new(
            &self.metadata.document_id,
            state.pages().len(),
            state.current_page_number(),
            state.results(),
        );
        if let Err(e) = checkpoint::save(path, &cp).await {
            warn!("{}", e);
        }
    }
}

/// The last `window` successful results, oldest first.
fn rolling_context(results: &[AggregatedResult], window: usize) -> Vec<PriorPage<'_>> {
    let ok: Vec<&AggregatedResult> = results.iter().filter(|r| !r.is_failed()).collect();
    let skip = ok.len().saturating_sub(window);
    ok.into_iter()
        .skip(skip)
        .map(|r| PriorPage {
            page_number: r.page_number,
            text: &r.text,
        })
        .collect()
}

/// Fill company, event and date from the config, else "Not provided".
fn apply_overrides(metadata: &mut DocumentMetadata, config: &PipelineConfig) {
    let pick = |over: &Option<String>, current: &str| -> String {
        match over {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ if !current.trim().is_empty() => current.to_string(),
            _ => NOT_PROVIDED.to_string(),
        }
    };
    metadata.company = pick(&config.company, &metadata.company);
    metadata.event = pick(&config.event, &metadata.event);
    metadata.date = pick(&config.date, &metadata.date);
    if metadata.title.trim().is_empty() {
        metadata.title = NOT_PROVIDED.to_string();
    }
}

fn resolve_search(config: &PipelineConfig) -> Option<Arc<dyn SearchCapability>> {
    if let Some(ref search) = config.search {
        return Some(Arc::clone(search));
    }
    let key = config.tavily_api_key.as_deref().filter(|k| !k.is_empty())?;
    match TavilySearch::new(key, Duration::from_secs(config.api_timeout_secs)) {
        Ok(s) => Some(Arc::new(s)),
        Err(e) => {
            warn!("Search tool disabled: {}", e);
            None
        }
    }
}

fn resolve_schema(config: &PipelineConfig) -> Option<SchemaCatalog> {
    let loaded = match config.schema_path {
        Some(ref path) => SchemaCatalog::load(path),
        None => SchemaCatalog::builtin(),
    };
    match loaded {
        Ok(catalog) => Some(catalog),
        Err(e) => {
            warn!("Schema tool disabled: {}", e);
            None
        }
    }
}

fn collect_warnings(state: &TraversalState) -> Vec<String> {
    let mut warnings = Vec::new();
    let results = state.results();
    let total = state.pages().len();

    if state.has_count_warning() {
        warnings.push(format!(
            "{} results for {} pages: a page was processed more than once",
            results.len(),
            total
        ));
    }
    let failed: Vec<String> = results
        .iter()
        .filter(|r| r.is_failed())
        .map(|r| r.page_number.to_string())
        .collect();
    if !failed.is_empty() {
        warnings.push(format!("extraction failed for page(s) {}", failed.join(", ")));
    }
    let degraded: Vec<String> = results
        .iter()
        .filter(|r| r.is_degraded())
        .map(|r| r.page_number.to_string())
        .collect();
    if !degraded.is_empty() {
        warnings.push(format!("aggregation degraded for page(s) {}", degraded.join(", ")));
    }
    if state.anomaly().is_none() {
        if !state.position_at_end() {
            warnings.push("traversal position and result count disagree".to_string());
        }
        let mut seen: Vec<usize> = results.iter().map(|r| r.page_number).collect();
        seen.sort_unstable();
        seen.dedup();
        let missing: Vec<String> = state
            .pages()
            .iter()
            .map(|p| p.page_number)
            .filter(|n| seen.binary_search(n).is_err())
            .map(|n| n.to_string())
            .collect();
        if !missing.is_empty() {
            warnings.push(format!("no result for page(s) {}", missing.join(", ")));
        }
    }
    for w in &warnings {
        warn!("{}", w);
    }
    warnings
}
