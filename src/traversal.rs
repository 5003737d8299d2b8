//! Page traversal state machine.
//!
//! ```text
//! NOT_STARTED ──advance──▶ IN_PROGRESS ──(select → extract → aggregate → check)──┐
//!                               ▲                                                │
//!                               └──────────────── not complete ◀─────────────────┘
//!                                                      │ complete
//!                                                      ▼
//!                                                  COMPLETE
//! ```
//!
//! Two independent checks drive termination. [`advance`] is position based and
//! picks the next page by collection order; [`check_complete`] is count based
//! and compares produced results against the page total. A provider failing
//! mid-page never moves the position, so the count is the authoritative
//! completion signal while the position is the authoritative next-step
//! selector.
//!
//! Both transitions consume the previous state and return the next one, so a
//! stage can never observe a half-updated record.

use crate::output::{AggregatedResult, Page, TraversalAnomaly};
use tracing::{debug, error, info, warn};

/// Coarse phase derived from the state fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalPhase {
    NotStarted,
    InProgress,
    Complete,
}

/// Outcome of the most recent [`check_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCheck {
    /// The document has no pages.
    EmptyDocument,
    /// Fewer results than pages.
    InProgress { produced: usize, total: usize },
    /// Exactly one result per page.
    Complete { total: usize },
    /// More results than pages: some page was processed twice.
    Overcount { produced: usize, total: usize },
}

/// Single-writer traversal record.
#[derive(Debug, Clone)]
pub struct TraversalState {
    pages: Vec<Page>,
    current_page: Option<usize>,
    results: Vec<AggregatedResult>,
    complete: bool,
    anomaly: Option<TraversalAnomaly>,
    last_check: Option<CompletionCheck>,
}

impl TraversalState {
    /// Fresh state positioned before the first page.
    pub fn new(pages: Vec<Page>) -> Self {
        Self {
            pages,
            current_page: None,
            results: Vec::new(),
            complete: false,
            anomaly: None,
            last_check: None,
        }
    }

    /// Restore a state from previously completed work, positioned on
    /// `current_page` so the next [`advance`] moves past it.
    pub fn resume(
        pages: Vec<Page>,
        results: Vec<AggregatedResult>,
        current_page: Option<usize>,
    ) -> Self {
        Self {
            pages,
            current_page,
            results,
            complete: false,
            anomaly: None,
            last_check: None,
        }
    }

    /// Append the aggregated result for the current page.
    pub fn record(mut self, result: AggregatedResult) -> Self {
        debug!(
            page = result.page_number,
            produced = self.results.len() + 1,
            "recorded page result"
        );
        self.results.push(result);
        self
    }

    /// Force completion with a fatal anomaly recorded.
    pub fn abort(mut self, anomaly: TraversalAnomaly) -> Self {
        error!("traversal aborted: {anomaly}");
        self.complete = true;
        self.anomaly = Some(anomaly);
        self
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn current_page_number(&self) -> Option<usize> {
        self.current_page
    }

    /// The current page, looked up by number.
    pub fn current_page(&self) -> Option<&Page> {
        let number = self.current_page?;
        self.pages.iter().find(|p| p.page_number == number)
    }

    pub fn results(&self) -> &[AggregatedResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<AggregatedResult> {
        self.results
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn anomaly(&self) -> Option<&TraversalAnomaly> {
        self.anomaly.as_ref()
    }

    pub fn last_check(&self) -> Option<CompletionCheck> {
        self.last_check
    }

    /// Set when [`check_complete`] saw more results than pages.
    pub fn has_count_warning(&self) -> bool {
        matches!(self.last_check, Some(CompletionCheck::Overcount { .. }))
    }

    pub fn phase(&self) -> TraversalPhase {
        if self.complete {
            TraversalPhase::Complete
        } else if self.current_page.is_none() && self.results.is_empty() {
            TraversalPhase::NotStarted
        } else {
            TraversalPhase::InProgress
        }
    }

    /// Whether the position-based view agrees that the run is finished:
    /// either there are no pages or the pointer sits on the last page.
    pub fn position_at_end(&self) -> bool {
        match (self.pages.last(), self.current_page) {
            (None, _) => true,
            (Some(last), Some(current)) => last.page_number == current,
            (Some(_), None) => self.complete && self.anomaly.is_none() && !self.results.is_empty(),
        }
    }
}

/// Select the next page, or mark the traversal complete.
pub fn advance(mut state: TraversalState) -> TraversalState {
    if state.pages.is_empty() {
        info!("document has no pages");
        state.complete = true;
        state.current_page = None;
        return state;
    }

    let Some(current) = state.current_page else {
        let first = state.pages[0].page_number;
        info!("processing page {} of {}", first, state.pages.len());
        state.current_page = Some(first);
        return state;
    };

    let Some(position) = state.pages.iter().position(|p| p.page_number == current) else {
        return state.abort(TraversalAnomaly::PageNotFound {
            page_number: current,
        });
    };

    match state.pages.get(position + 1) {
        Some(next) => {
            info!(
                "processing page {} ({} of {})",
                next.page_number,
                position + 2,
                state.pages.len()
            );
            state.current_page = Some(next.page_number);
        }
        None => {
            info!("all {} pages visited", state.pages.len());
            state.complete = true;
            state.current_page = None;
        }
    }
    state
}

/// Count-based completion check, run after each page's aggregation.
pub fn check_complete(mut state: TraversalState) -> TraversalState {
    let total = state.pages.len();
    let produced = state.results.len();

    let check = if total == 0 {
        CompletionCheck::EmptyDocument
    } else if produced < total {
        CompletionCheck::InProgress { produced, total }
    } else if produced == total {
        CompletionCheck::Complete { total }
    } else {
        CompletionCheck::Overcount { produced, total }
    };

    match check {
        CompletionCheck::EmptyDocument => state.complete = true,
        CompletionCheck::InProgress { produced, total } => {
            debug!("progress: {produced}/{total} pages");
        }
        CompletionCheck::Complete { total } => {
            info!("all {total} pages produced a result");
            state.complete = true;
        }
        CompletionCheck::Overcount { produced, total } => {
            warn!(
                "{produced} results for {total} pages; a page was processed more than once"
            );
            state.complete = true;
        }
    }
    state.last_check = Some(check);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{PageImage, ResultStatus};

    fn pages(numbers: &[usize]) -> Vec<Page> {
        numbers
            .iter()
            .map(|&n| Page {
                page_number: n,
                image: PageImage::png(format!("img{n}")),
            })
            .collect()
    }

    fn result(page: usize) -> AggregatedResult {
        AggregatedResult {
            page_number: page,
            text: format!("page {page}"),
            source_count: 1,
            contributors: vec!["a".into()],
            status: ResultStatus::Passthrough,
        }
    }

    #[test]
    fn advance_visits_every_page_once_in_collection_order() {
        // Non-contiguous numbering: order comes from the collection.
        let mut state = TraversalState::new(pages(&[4, 1, 9, 2]));
        assert_eq!(state.phase(), TraversalPhase::NotStarted);

        let mut visited = Vec::new();
        loop {
            state = advance(state);
            if state.is_complete() {
                break;
            }
            visited.push(state.current_page_number().unwrap());
            assert!(visited.len() <= 4, "traversal did not terminate");
        }

        assert_eq!(visited, vec![4, 1, 9, 2]);
        assert_eq!(state.current_page_number(), None);
        assert!(state.anomaly().is_none());
        assert_eq!(state.phase(), TraversalPhase::Complete);
    }

    #[test]
    fn advance_on_empty_document_completes_immediately() {
        let state = advance(TraversalState::new(Vec::new()));
        assert!(state.is_complete());
        assert_eq!(state.current_page_number(), None);
        assert!(state.anomaly().is_none());
    }

    #[test]
    fn advance_with_unknown_current_page_is_fatal() {
        let state = TraversalState::resume(pages(&[1, 2, 3]), Vec::new(), Some(42));
        let state = advance(state);
        assert!(state.is_complete());
        assert_eq!(
            state.anomaly(),
            Some(&TraversalAnomaly::PageNotFound { page_number: 42 })
        );
        // Does not move the pointer anywhere.
        assert_eq!(state.current_page_number(), Some(42));
        assert!(!state.position_at_end());
    }

    #[test]
    fn resume_continues_after_restored_page() {
        let state = TraversalState::resume(pages(&[1, 2, 3]), vec![result(1), result(2)], Some(2));
        let state = advance(state);
        assert_eq!(state.current_page_number(), Some(3));
        assert_eq!(state.current_page().map(|p| p.page_number), Some(3));
    }

    #[test]
    fn check_complete_reports_progress_then_completion() {
        let mut state = advance(TraversalState::new(pages(&[1, 2])));
        state = check_complete(state.record(result(1)));
        assert!(!state.is_complete());
        assert_eq!(
            state.last_check(),
            Some(CompletionCheck::InProgress {
                produced: 1,
                total: 2
            })
        );

        state = advance(state);
        state = check_complete(state.record(result(2)));
        assert!(state.is_complete());
        assert!(state.position_at_end());
        assert!(!state.has_count_warning());
    }

    #[test]
    fn check_complete_on_empty_document() {
        let state = check_complete(TraversalState::new(Vec::new()));
        assert!(state.is_complete());
        assert_eq!(state.last_check(), Some(CompletionCheck::EmptyDocument));
    }

    #[test]
    fn check_complete_flags_overcount_without_panicking() {
        let state = TraversalState::resume(
            pages(&[1, 2]),
            vec![result(1), result(2), result(2)],
            Some(2),
        );
        let state = check_complete(state);
        assert!(state.is_complete());
        assert!(state.has_count_warning());
        assert_eq!(state.results().len(), 3, "results are never discarded");
    }
}
