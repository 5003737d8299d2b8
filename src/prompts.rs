//! Prompt text and prompt builders.
//!
//! Every string the models see is assembled here, so the provider and
//! aggregation code never embeds wording of its own. Tests can inspect the
//! builders directly without a backend.

use crate::output::{DocumentMetadata, ExtractionRecord};
use crate::provider::{TranscriptEntry, TranscriptRole};
use crate::tools::TOOL_CALL_MARKER;

/// System prompt for per-slide extraction.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You extract pharmaceutical and life-sciences facts from corporate presentation slides for a structured database.

Cover every kind of information the slide carries:
- Core entities: companies, drugs (with code names and brand names), diseases, molecular targets, modalities, drug classes, geographies
- Development: research programs, drug-target links, combinations, development stage
- Clinical: trial names and registry ids, design, arms, endpoints, enrollment, results
- Regulatory: submissions, approvals, designations, exclusivity, patents, milestones
- Commercial and financial: brands, pricing, market size, forecasts, deals, partnerships, investments
- People and research: key personnel, publications, congress presentations
- Catalysts: upcoming readouts, decisions, launches, terminations

For every data point record where on the slide it appears, whether it is presented as fact or projection, who makes the claim, and a confidence level from 1 to 5.

First describe the slide briefly, then give the extraction. Use markdown with one `##` section per entity type (for example `## Drugs`, `## Clinical Trials`, `## Regulatory`), so each section can be indexed on its own."#;

/// System prompt for merging several extractions of the same slide.
pub const AGGREGATION_SYSTEM_PROMPT: &str = r#"You reconcile several independent extractions of the same presentation slide into one authoritative extraction.

Rules:
- Keep every fact that at least one extraction supports; never drop a candidate's unique finding without reason.
- When extractions agree, state the fact once and raise its confidence.
- When they conflict, prefer the reading that is more specific and better supported by the slide description; note the disagreement and lower the confidence.
- Keep the citation details (slide location, fact vs projection, claimant) and the 1 to 5 confidence levels.
- Keep the same markdown layout: one `##` section per entity type.

Output only the merged extraction."#;

/// One earlier page quoted as context.
#[derive(Debug, Clone, Copy)]
pub struct PriorPage<'a> {
    pub page_number: usize,
    pub text: &'a str,
}

/// User prompt for one slide.
pub fn extraction_user_prompt(
    metadata: &DocumentMetadata,
    page_number: usize,
    total_pages: usize,
    prior: &[PriorPage<'_>],
) -> String {
    let mut prompt = format!(
        "Extract all pharmaceutical data from this presentation slide.\n\n\
         ### Document Metadata\n\
         - Presentation Title: {}\n\
         - Company/Author: {}\n\
         - Date: {}\n\
         - Event/Venue: {}\n\
         - Slide Number: {} of {}\n\
         - Document Source ID: {}\n\n\
         ### Previous Context\n",
        metadata.title,
        metadata.company,
        metadata.date,
        metadata.event,
        page_number,
        total_pages,
        metadata.document_id,
    );

    if prior.is_empty() {
        prompt.push_str("This is the first slide processed.\n");
    } else {
        for p in prior {
            prompt.push_str(&format!("Slide {}:\n{}\n\n", p.page_number, p.text));
        }
    }

    prompt.push_str(
        "\nIdentify every entity and relationship on this slide, keep names and \
         numbers exactly as shown with their units, and cite each data point.",
    );
    prompt
}

/// Synthesis prompt presenting every candidate, labelled by provider.
pub fn synthesis_prompt(page_number: usize, candidates: &[ExtractionRecord]) -> String {
    let mut prompt = format!(
        "Merge the following {} extractions of slide {} into one.\n\n",
        candidates.len(),
        page_number
    );
    for (i, c) in candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "=== Extraction {} (source: {}) ===\n{}\n\n",
            i + 1,
            c.provider_id,
            c.text.trim()
        ));
    }
    prompt.push_str("=== End of extractions ===");
    prompt
}

/// Instructions appended to the system prompt when tools are on offer.
pub fn tool_protocol(catalogue: &str) -> String {
    format!(
        "You may consult tools before answering. To call one, reply with exactly one line and nothing else:\n\
         {TOOL_CALL_MARKER} {{\"tool\": \"<name>\", \"input\": <input>}}\n\
         You will receive the result and can call another tool or give your final answer. \
         A reply without a tool call is taken as the final answer.\n\n\
         Available tools:\n{catalogue}"
    )
}

/// The user prompt followed by the tool calls and observations so far.
pub fn with_scratchpad(user_prompt: &str, transcript: &[TranscriptEntry]) -> String {
    if transcript.is_empty() {
        return user_prompt.to_string();
    }
    let mut out = format!("{user_prompt}\n\n### Tool Results So Far\n");
    for entry in transcript {
        match entry.role {
            TranscriptRole::Assistant => {
                out.push_str(&format!("\nYou: {}\n", entry.content.trim()))
            }
            TranscriptRole::Tool => {
                out.push_str(&format!("\nObservation:\n{}\n", entry.content.trim()))
            }
        }
    }
    out.push_str("\nContinue: call another tool or give the final extraction.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> DocumentMetadata {
        DocumentMetadata {
            title: "Q3 Pipeline Update".into(),
            company: "Acme Pharma".into(),
            event: "Not provided".into(),
            date: "Not provided".into(),
            document_id: "decks/q3.pdf".into(),
            page_count: 12,
            ..Default::default()
        }
    }

    #[test]
    fn user_prompt_carries_metadata_and_real_page_numbers() {
        let prior = [
            PriorPage {
                page_number: 4,
                text: "Drug: A",
            },
            PriorPage {
                page_number: 7,
                text: "Drug: B",
            },
        ];
        let p = extraction_user_prompt(&meta(), 8, 12, &prior);
        assert!(p.contains("Slide Number: 8 of 12"));
        assert!(p.contains("Acme Pharma"));
        assert!(p.contains("Slide 4:\nDrug: A"));
        assert!(p.contains("Slide 7:\nDrug: B"));
    }

    #[test]
    fn first_slide_prompt_says_so() {
        let p = extraction_user_prompt(&meta(), 1, 12, &[]);
        assert!(p.contains("first slide"));
    }

    #[test]
    fn synthesis_prompt_labels_every_candidate() {
        let candidates = vec![
            ExtractionRecord {
                provider_id: "gemini:flash".into(),
                text: "X".into(),
                page_number: 2,
            },
            ExtractionRecord {
                provider_id: "openai:gpt-4.1".into(),
                text: "Y".into(),
                page_number: 2,
            },
        ];
        let p = synthesis_prompt(2, &candidates);
        assert!(p.contains("(source: gemini:flash) ===\nX"));
        assert!(p.contains("(source: openai:gpt-4.1) ===\nY"));
    }

    #[test]
    fn scratchpad_replays_transcript() {
        let t = vec![
            TranscriptEntry::assistant("TOOL_CALL: {\"tool\":\"search\",\"input\":\"x\"}"),
            TranscriptEntry::tool("### Search Results"),
        ];
        let p = with_scratchpad("BASE", &t);
        assert!(p.starts_with("BASE"));
        assert!(p.contains("Observation:\n### Search Results"));
        assert_eq!(with_scratchpad("BASE", &[]), "BASE");
    }
}
