//! Stage-graph integration tests driven by scripted providers.
//!
//! No network and no pdfium: documents are built in memory and passed to
//! `run_document`, embeddings use the local hashing embedder.

use async_trait::async_trait;
use pharmdeck::tools::ToolCall;
use pharmdeck::{
    run_document, AggregatedResult, Document, DocumentMetadata, ExportOutcome,
    ExtractionProgressCallback, ExtractionProvider, ExtractionRecord, ExtractionRequest, Page,
    PageImage, PipelineConfig, PipelineConfigBuilder, ProviderError, ResultStatus, RunStatus,
    ToolBox, TraversalAnomaly,
};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Provider with per-page failures that records what it was asked.
struct Scripted {
    id: &'static str,
    fail_pages: Vec<usize>,
    fail_synthesis: bool,
    /// Query memory for this concept before answering.
    lookup: Option<&'static str>,
    extracted: Mutex<Vec<usize>>,
    prompts: Mutex<Vec<String>>,
    observations: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            fail_pages: Vec::new(),
            fail_synthesis: false,
            lookup: None,
            extracted: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            observations: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(mut self, pages: &[usize]) -> Self {
        self.fail_pages = pages.to_vec();
        self
    }

    fn failing_synthesis(mut self) -> Self {
        self.fail_synthesis = true;
        self
    }

    fn looking_up(mut self, concept: &'static str) -> Self {
        self.lookup = Some(concept);
        self
    }

    fn extracted(&self) -> Vec<usize> {
        self.extracted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionProvider for Scripted {
    fn id(&self) -> &str {
        self.id
    }

    async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
        tools: &ToolBox<'_>,
    ) -> Result<String, ProviderError> {
        let page = request.page.page_number;
        self.extracted.lock().unwrap().push(page);
        self.prompts
            .lock()
            .unwrap()
            .push(request.user_prompt.to_string());

        if let Some(concept) = self.lookup {
            let observation = tools
                .invoke(Ok(ToolCall {
                    tool: "lookup_previous".to_string(),
                    input: json!({ "concept": concept }),
                }))
                .await;
            self.observations.lock().unwrap().push(observation);
        }

        if self.fail_pages.contains(&page) {
            return Err(ProviderError::Backend {
                provider: self.id.to_string(),
                detail: format!("scripted failure on slide {page}"),
            });
        }
        Ok(format!("## Drugs\n- Zoloxib 10 mg ({} on slide {page})", self.id))
    }

    async fn synthesize(
        &self,
        candidates: &[ExtractionRecord],
        _prompt: &str,
    ) -> Result<String, ProviderError> {
        if self.fail_synthesis {
            return Err(ProviderError::Backend {
                provider: self.id.to_string(),
                detail: "scripted synthesis failure".to_string(),
            });
        }
        let page = candidates.first().map(|c| c.page_number).unwrap_or(0);
        Ok(format!(
            "## Drugs\n- merged {} candidates for slide {page}",
            candidates.len()
        ))
    }
}

fn deck(numbers: &[usize]) -> Document {
    Document {
        metadata: DocumentMetadata {
            title: "Q3 Pipeline Update".into(),
            document_id: "decks/acme-q3.pdf".into(),
            ..Default::default()
        },
        pages: numbers
            .iter()
            .map(|&n| Page {
                page_number: n,
                image: PageImage::png(format!("c2xpZGU{n}")),
            })
            .collect(),
    }
}

fn base() -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .local_embeddings(true)
        .no_output_dir()
}

fn statuses(results: &[AggregatedResult]) -> Vec<(usize, &ResultStatus)> {
    results.iter().map(|r| (r.page_number, &r.status)).collect()
}

// ── Fan-out and aggregation ──────────────────────────────────────────────────

#[tokio::test]
async fn every_page_is_synthesized_and_exported_in_order() {
    let a = Arc::new(Scripted::new("alpha"));
    let b = Arc::new(Scripted::new("beta"));
    let config = base()
        .custom_provider(a.clone())
        .custom_provider(b.clone())
        .build()
        .unwrap();

    let out = run_document(deck(&[1, 2, 3]), &config).await.unwrap();

    assert_eq!(out.status, RunStatus::Complete);
    assert_eq!(out.results.len(), 3);
    for r in &out.results {
        assert_eq!(r.status, ResultStatus::Synthesized);
        assert_eq!(r.source_count, 2);
        assert_eq!(r.contributors, vec!["alpha", "beta"]);
    }
    assert_eq!(a.extracted(), vec![1, 2, 3]);
    assert_eq!(b.extracted(), vec![1, 2, 3]);

    assert_eq!(out.export_outcome, ExportOutcome::InMemory);
    let s1 = out.export.find("## Slide 1").unwrap();
    let s2 = out.export.find("## Slide 2").unwrap();
    let s3 = out.export.find("## Slide 3").unwrap();
    assert!(s1 < s2 && s2 < s3);
    assert!(out.export.contains("merged 2 candidates for slide 2"));
    assert!(out.export.contains("\n\n---\n\n"));
    assert!(out.stats.memory_chunks > 0);
}

#[tokio::test]
async fn single_success_is_passed_through_verbatim() {
    let a = Arc::new(Scripted::new("alpha").failing_on(&[2]));
    let b = Arc::new(Scripted::new("beta"));
    let config = base()
        .custom_provider(a)
        .custom_provider(b)
        .build()
        .unwrap();

    let out = run_document(deck(&[1, 2]), &config).await.unwrap();

    let page2 = &out.results[1];
    assert_eq!(page2.status, ResultStatus::Passthrough);
    assert_eq!(page2.source_count, 1);
    assert_eq!(page2.contributors, vec!["beta"]);
    assert_eq!(page2.text, "## Drugs\n- Zoloxib 10 mg (beta on slide 2)");
}

#[tokio::test]
async fn aggregator_failure_keeps_first_candidate() {
    let a = Arc::new(Scripted::new("alpha"));
    let b = Arc::new(Scripted::new("beta"));
    let judge = Arc::new(Scripted::new("judge").failing_synthesis());
    let config = base()
        .custom_provider(a)
        .custom_provider(b)
        .custom_aggregator(judge.clone())
        .build()
        .unwrap();

    let out = run_document(deck(&[1]), &config).await.unwrap();

    let r = &out.results[0];
    assert!(r.is_degraded());
    assert_eq!(r.source_count, 2);
    assert_eq!(r.text, "## Drugs\n- Zoloxib 10 mg (alpha on slide 1)");
    // The aggregator never extracts.
    assert!(judge.extracted().is_empty());
    assert!(matches!(out.status, RunStatus::CompleteWithWarnings { .. }));
    assert_eq!(out.stats.degraded_pages, 1);
}

#[tokio::test]
async fn failed_page_gets_placeholder_and_run_continues() {
    let a = Arc::new(Scripted::new("alpha").failing_on(&[2]));
    let b = Arc::new(Scripted::new("beta").failing_on(&[2]));
    let config = base()
        .custom_provider(a.clone())
        .custom_provider(b)
        .build()
        .unwrap();

    let out = run_document(deck(&[1, 2, 3]), &config).await.unwrap();

    assert_eq!(a.extracted(), vec![1, 2, 3]);
    assert_eq!(out.results.len(), 3);
    assert!(out.results[1].is_failed());
    assert_eq!(out.results[1].source_count, 0);
    assert_eq!(out.stats.failed_pages, 1);
    assert_eq!(out.stats.processed_pages, 2);

    match &out.status {
        RunStatus::CompleteWithWarnings { warnings } => {
            assert!(warnings.iter().any(|w| w.contains("page(s) 2")));
        }
        other => panic!("unexpected status {other:?}"),
    }
    // The placeholder is still exported in its slot.
    assert!(out.export.contains("## Slide 2\n\n_Extraction failed"));
}

#[tokio::test]
async fn nothing_is_written_when_every_page_fails() {
    let dir = tempfile::tempdir().unwrap();
    let a = Arc::new(Scripted::new("alpha").failing_on(&[1, 2]));
    let config = PipelineConfig::builder()
        .local_embeddings(true)
        .output_dir(dir.path())
        .custom_provider(a)
        .build()
        .unwrap();

    let out = run_document(deck(&[1, 2]), &config).await.unwrap();

    assert_eq!(out.export_outcome, ExportOutcome::NothingExtracted);
    assert!(out.export.is_empty());
    assert!(!dir.path().join("acme-q3_combined.md").exists());
    assert_eq!(out.stats.failed_pages, 2);
}

#[tokio::test]
async fn empty_document_completes_without_calling_providers() {
    let a = Arc::new(Scripted::new("alpha"));
    let config = base().custom_provider(a.clone()).build().unwrap();

    let out = run_document(deck(&[]), &config).await.unwrap();

    assert!(out.results.is_empty());
    assert!(a.extracted().is_empty());
    assert_eq!(out.export_outcome, ExportOutcome::NothingExtracted);
    assert_eq!(out.stats.total_pages, 0);
}

// ── Prompt context and memory ────────────────────────────────────────────────

#[tokio::test]
async fn prompts_quote_previous_pages_and_metadata_defaults() {
    let a = Arc::new(Scripted::new("alpha").failing_on(&[3]));
    let config = base()
        .custom_provider(a.clone())
        .company("Acme Pharma")
        .context_window(2)
        .build()
        .unwrap();

    run_document(deck(&[1, 2, 3, 4, 5]), &config).await.unwrap();

    let prompts = a.prompts.lock().unwrap().clone();
    assert!(prompts[0].contains("This is the first slide processed."));
    assert!(prompts[0].contains("Company/Author: Acme Pharma"));
    assert!(prompts[0].contains("Event/Venue: Not provided"));
    assert!(prompts[0].contains("Slide Number: 1 of 5"));
    // Slide 5 sees slides 2 and 4; the failed slide 3 is skipped.
    assert!(prompts[4].contains("Slide 2:\n"));
    assert!(prompts[4].contains("Slide 4:\n"));
    assert!(!prompts[4].contains("Slide 3:\n"));
    assert!(!prompts[4].contains("Slide 1:\n"));
}

#[tokio::test]
async fn later_pages_can_look_up_earlier_ones() {
    let a = Arc::new(Scripted::new("alpha").looking_up("Zoloxib"));
    let config = base().custom_provider(a.clone()).build().unwrap();

    let out = run_document(deck(&[1, 2]), &config).await.unwrap();

    let observations = a.observations.lock().unwrap().clone();
    assert_eq!(observations.len(), 2);
    assert!(observations[0].starts_with("No information found"));
    assert!(observations[1].contains("From Slide 1"));
    // Section chunk plus the whole-page chunk, per page.
    assert_eq!(out.stats.memory_chunks, 4);
}

#[tokio::test]
async fn disabled_tools_are_not_offered() {
    struct NoTools;

    #[async_trait]
    impl ExtractionProvider for NoTools {
        fn id(&self) -> &str {
            "plain"
        }

        async fn extract(
            &self,
            _request: &ExtractionRequest<'_>,
            tools: &ToolBox<'_>,
        ) -> Result<String, ProviderError> {
            assert!(tools.is_empty());
            Ok("no tools".to_string())
        }

        async fn synthesize(
            &self,
            _candidates: &[ExtractionRecord],
            _prompt: &str,
        ) -> Result<String, ProviderError> {
            Ok("unused".to_string())
        }
    }

    let config = base()
        .custom_provider(Arc::new(NoTools))
        .enable_tools(false)
        .build()
        .unwrap();
    let out = run_document(deck(&[1]), &config).await.unwrap();
    assert_eq!(out.results[0].text, "no tools");
}

// ── Termination, checkpoints and resume ──────────────────────────────────────

fn checkpoint_file(dir: &Path) -> std::path::PathBuf {
    dir.join("acme-q3.checkpoint.json")
}

#[tokio::test]
async fn step_limit_aborts_and_keeps_partial_work() {
    let dir = tempfile::tempdir().unwrap();
    let a = Arc::new(Scripted::new("alpha"));
    let config = PipelineConfig::builder()
        .local_embeddings(true)
        .output_dir(dir.path())
        .custom_provider(a.clone())
        .max_stage_steps(4)
        .build()
        .unwrap();

    let out = run_document(deck(&[1, 2, 3]), &config).await.unwrap();

    assert_eq!(
        out.status,
        RunStatus::Aborted {
            anomaly: TraversalAnomaly::StepLimitExceeded { limit: 4 }
        }
    );
    assert_eq!(a.extracted(), vec![1]);
    assert_eq!(out.results.len(), 1);
    assert!(matches!(out.export_outcome, ExportOutcome::Written { .. }));
    assert!(checkpoint_file(dir.path()).exists());
}

#[tokio::test]
async fn resume_skips_checkpointed_pages() {
    let dir = tempfile::tempdir().unwrap();

    // First run stops after slide 1 and leaves its checkpoint behind.
    let first = Arc::new(Scripted::new("alpha"));
    let config = PipelineConfig::builder()
        .local_embeddings(true)
        .output_dir(dir.path())
        .custom_provider(first)
        .max_stage_steps(4)
        .build()
        .unwrap();
    run_document(deck(&[1, 2, 3]), &config).await.unwrap();
    assert!(checkpoint_file(dir.path()).exists());

    let second = Arc::new(Scripted::new("alpha"));
    let config = PipelineConfig::builder()
        .local_embeddings(true)
        .output_dir(dir.path())
        .custom_provider(second.clone())
        .resume(true)
        .build()
        .unwrap();
    let out = run_document(deck(&[1, 2, 3]), &config).await.unwrap();

    assert_eq!(second.extracted(), vec![2, 3]);
    assert_eq!(out.stats.resumed_pages, 1);
    assert_eq!(out.status, RunStatus::Complete);
    assert_eq!(out.results.len(), 3);
    assert!(!checkpoint_file(dir.path()).exists());

    let written = std::fs::read_to_string(dir.path().join("acme-q3_combined.md")).unwrap();
    assert_eq!(written, out.export);
    assert!(written.contains("## Slide 3"));
}

#[tokio::test]
async fn checkpoint_for_another_deck_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let stop_early = PipelineConfig::builder()
        .local_embeddings(true)
        .output_dir(dir.path())
        .custom_provider(Arc::new(Scripted::new("alpha")))
        .max_stage_steps(4)
        .build()
        .unwrap();
    run_document(deck(&[1, 2, 3]), &stop_early).await.unwrap();

    // Same id, different page count.
    let a = Arc::new(Scripted::new("alpha"));
    let config = PipelineConfig::builder()
        .local_embeddings(true)
        .output_dir(dir.path())
        .custom_provider(a.clone())
        .resume(true)
        .build()
        .unwrap();
    let out = run_document(deck(&[1, 2]), &config).await.unwrap();

    assert_eq!(a.extracted(), vec![1, 2]);
    assert_eq!(out.stats.resumed_pages, 0);
}

#[tokio::test]
async fn checkpoint_with_a_gap_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    // Positioned on slide 2 but only slide 1 was saved.
    let saved = AggregatedResult {
        page_number: 1,
        text: "## Drugs\n- Zoloxib".into(),
        source_count: 1,
        contributors: vec!["alpha".into()],
        status: ResultStatus::Passthrough,
    };
    let checkpoint = json!({
        "document_id": "decks/acme-q3.pdf",
        "page_count": 3,
        "current_page": 2,
        "results": [saved],
        "saved_at": "2026-01-01T00:00:00Z",
    });
    std::fs::write(checkpoint_file(dir.path()), checkpoint.to_string()).unwrap();

    let a = Arc::new(Scripted::new("alpha"));
    let config = PipelineConfig::builder()
        .local_embeddings(true)
        .output_dir(dir.path())
        .custom_provider(a.clone())
        .resume(true)
        .build()
        .unwrap();
    let out = run_document(deck(&[1, 2, 3]), &config).await.unwrap();

    assert_eq!(a.extracted(), vec![1, 2, 3]);
    assert_eq!(out.stats.resumed_pages, 0);
    assert_eq!(out.status, RunStatus::Complete);
    let pages: Vec<usize> = out.results.iter().map(|r| r.page_number).collect();
    assert_eq!(pages, vec![1, 2, 3]);
}

// ── Progress events ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl ExtractionProgressCallback for Recorder {
    fn on_run_start(&self, total_pages: usize, resumed_pages: usize) {
        self.push(format!("start {total_pages} {resumed_pages}"));
    }
    fn on_provider_result(&self, page_number: usize, provider_id: &str, ok: bool) {
        self.push(format!("provider {page_number} {provider_id} {ok}"));
    }
    fn on_page_complete(&self, page_number: usize, _total: usize, source_count: usize) {
        self.push(format!("done {page_number} {source_count}"));
    }
    fn on_page_error(&self, page_number: usize, _total: usize, _error: &str) {
        self.push(format!("error {page_number}"));
    }
    fn on_run_complete(&self, total_pages: usize, success_count: usize) {
        self.push(format!("finish {total_pages} {success_count}"));
    }
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn progress_events_follow_the_run() {
    let recorder = Arc::new(Recorder::default());
    let config = base()
        .custom_provider(Arc::new(Scripted::new("alpha").failing_on(&[2])))
        .custom_provider(Arc::new(Scripted::new("beta").failing_on(&[2])))
        .progress_callback(recorder.clone())
        .build()
        .unwrap();

    let out = run_document(deck(&[1, 2]), &config).await.unwrap();
    assert_eq!(
        statuses(&out.results)[0],
        (1, &ResultStatus::Synthesized)
    );

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "start 2 0",
            "provider 1 alpha true",
            "provider 1 beta true",
            "done 1 2",
            "provider 2 alpha false",
            "provider 2 beta false",
            "error 2",
            "finish 2 1",
        ]
    );
}
