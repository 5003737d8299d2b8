//! Tools offered to providers during tool-augmented extraction.
//!
//! A model asks for a tool by answering with a single line:
//!
//! ```text
//! TOOL_CALL: {"tool": "lookup_previous", "input": {"concept": "Xarelto", "page_range": "1-4"}}
//! ```
//!
//! The result comes back as an observation and the model is called again.
//! Three tools exist:
//!
//! | Tool | Backed by | Purpose |
//! |------|-----------|---------|
//! | `lookup_previous` | [`MemoryIndex`] | cross-page consistency |
//! | `search` | [`SearchCapability`] | unknown drugs, companies, terms |
//! | `check_schema` | [`SchemaCatalog`] | where an entity belongs |
//!
//! Every failure (unknown tool, malformed call, backend error) becomes an
//! error observation. A tool can never fail the provider.

use crate::error::ToolError;
use crate::memory::{ChunkCategory, MemoryIndex, PageRange, QueryFilter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Marker that opens a tool request in a model reply.
pub const TOOL_CALL_MARKER: &str = "TOOL_CALL:";

/// A parsed tool request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub input: Value,
}

/// Find a tool request in a model reply.
///
/// Returns `None` for a final answer, `Some(Err)` when the marker is present
/// but the payload is not a valid call.
pub fn parse_tool_call(reply: &str) -> Option<Result<ToolCall, String>> {
    let start = reply.match_indices(TOOL_CALL_MARKER).map(|(i, _)| i).find(|&i| {
        // Only a marker that opens its line counts.
        reply[..i]
            .rsplit('\n')
            .next()
            .is_none_or(|prefix| prefix.trim().is_empty())
    })?;
    let payload = reply[start + TOOL_CALL_MARKER.len()..].trim_start();

    let value = serde_json::Deserializer::from_str(payload)
        .into_iter::<Value>()
        .next();
    Some(match value {
        Some(Ok(v)) => serde_json::from_value::<ToolCall>(v)
            .map_err(|e| format!("malformed tool call: {e}")),
        Some(Err(e)) => Err(format!("malformed tool call: {e}")),
        None => Err("malformed tool call: missing JSON payload".to_string()),
    })
}

// ── Search ───────────────────────────────────────────────────────────────

/// External search: `search(term) → snippet`.
#[async_trait]
pub trait SearchCapability: Send + Sync {
    async fn search(&self, term: &str) -> Result<String, ToolError>;
}

/// Tavily search restricted to clinical and regulatory sources.
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    max_results: usize,
    include_domains: Vec<String>,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ToolError::Search("missing Tavily API key".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Search(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            endpoint: "https://api.tavily.com/search".to_string(),
            max_results: 5,
            include_domains: vec![
                "pubmed.ncbi.nlm.nih.gov".into(),
                "clinicaltrials.gov".into(),
                "fda.gov".into(),
            ],
        })
    }
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: String,
    max_results: usize,
    include_domains: &'a [String],
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl SearchCapability for TavilySearch {
    async fn search(&self, term: &str) -> Result<String, ToolError> {
        let request = TavilyRequest {
            api_key: &self.api_key,
            query: format!("pharmaceutical {term}"),
            max_results: self.max_results,
            include_domains: &self.include_domains,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolError::Search(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolError::Search(format!("HTTP {}", resp.status())));
        }
        let parsed: TavilyResponse = resp
            .json()
            .await
            .map_err(|e| ToolError::Search(format!("bad response: {e}")))?;

        let mut out = String::from("### Search Results\n\n");
        for (i, r) in parsed.results.iter().enumerate() {
            out.push_str(&format!("{}. **{}**\n{}\n\n", i + 1, r.title, r.content));
        }
        Ok(out)
    }
}

// ── Schema catalogue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub description: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Reference catalogue of modules → tables → fields.
///
/// Reference data only: extractions are never validated against it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaCatalog {
    modules: BTreeMap<String, BTreeMap<String, TableSpec>>,
}

const BUILTIN_SCHEMA: &str = include_str!("../data/pharma_schema.json");

impl SchemaCatalog {
    /// The catalogue shipped with the crate.
    pub fn builtin() -> Result<Self, ToolError> {
        Self::from_json(BUILTIN_SCHEMA)
    }

    pub fn from_json(json: &str) -> Result<Self, ToolError> {
        serde_json::from_str(json).map_err(|e| ToolError::Schema(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ToolError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ToolError::Schema(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Look up a table, then a module, then partial table-name matches.
    pub fn lookup(&self, entity_type: &str) -> Value {
        let lowered = entity_type.trim().to_lowercase();
        let wanted = match lowered.as_str() {
            "drug" => "drugs",
            "company" => "companies",
            "disease" => "diseases",
            "target" => "molecular_targets",
            other => other,
        }
        .to_string();

        for (module, tables) in &self.modules {
            if let Some(spec) = tables.get(&wanted) {
                return json!({
                    "module": module,
                    "table": wanted,
                    "description": spec.description,
                    "fields": spec.fields,
                });
            }
        }

        if let Some(tables) = self.modules.get(&wanted) {
            let summary: BTreeMap<&String, Value> = tables
                .iter()
                .map(|(name, spec)| {
                    (
                        name,
                        json!({"description": spec.description, "field_count": spec.fields.len()}),
                    )
                })
                .collect();
            return json!({"module": wanted, "tables": summary});
        }

        let needle = wanted.as_str();
        let partial: Vec<Value> = self
            .modules
            .iter()
            .flat_map(|(module, tables)| {
                tables
                    .iter()
                    .filter(move |(name, _)| !needle.is_empty() && name.contains(needle))
                    .map(move |(name, spec)| {
                        json!({"module": module, "table": name, "description": spec.description})
                    })
            })
            .collect();
        if !partial.is_empty() {
            return json!({"partial_matches": partial});
        }

        json!({
            "error": format!("No schema information found for '{wanted}'"),
            "suggestion": "Try a common entity like 'drugs', 'companies', 'diseases', or a module name like 'clinical', 'regulatory'",
        })
    }
}

// ── Tool box ─────────────────────────────────────────────────────────────

/// The capabilities available to one extraction call.
#[derive(Clone, Copy, Default)]
pub struct ToolBox<'a> {
    memory: Option<&'a MemoryIndex>,
    search: Option<&'a dyn SearchCapability>,
    schema: Option<&'a SchemaCatalog>,
}

impl<'a> ToolBox<'a> {
    /// No tools: providers answer in a single call.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(
        memory: Option<&'a MemoryIndex>,
        search: Option<&'a dyn SearchCapability>,
        schema: Option<&'a SchemaCatalog>,
    ) -> Self {
        Self {
            memory,
            search,
            schema,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.search.is_none() && self.schema.is_none()
    }

    /// Names of the available tools, in a fixed order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.memory.is_some() {
            names.push("lookup_previous");
        }
        if self.search.is_some() {
            names.push("search");
        }
        if self.schema.is_some() {
            names.push("check_schema");
        }
        names
    }

    /// Tool catalogue for the system prompt.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        if self.memory.is_some() {
            out.push_str(
                "- lookup_previous: what earlier slides said about a drug, company, trial or concept.\n  \
                 input: {\"concept\": string, \"category\"?: section header, \"page_range\"?: \"2-4\"}\n",
            );
        }
        if self.search.is_some() {
            out.push_str(
                "- search: look up an unknown drug, company or technical term in PubMed, ClinicalTrials.gov and FDA sources.\n  \
                 input: string\n",
            );
        }
        if self.schema.is_some() {
            out.push_str(
                "- check_schema: where an entity type belongs in the database schema.\n  \
                 input: entity type, table or module name (e.g. \"drug\", \"clinical_trials\", \"regulatory\")\n",
            );
        }
        out
    }

    /// Run a (possibly malformed) call and return the observation text.
    pub async fn invoke(&self, call: Result<ToolCall, String>) -> String {
        let call = match call {
            Ok(c) => c,
            Err(e) => return format!("Error: {e}"),
        };
        debug!(tool = %call.tool, "tool call");
        match call.tool.as_str() {
            "lookup_previous" => match self.memory {
                Some(memory) => lookup_previous(memory, &call.input).await,
                None => unavailable("lookup_previous"),
            },
            "search" => match self.search {
                Some(search) => run_search(search, &call.input).await,
                None => unavailable("search"),
            },
            "check_schema" => match self.schema {
                Some(schema) => check_schema(schema, &call.input),
                None => unavailable("check_schema"),
            },
            other => {
                warn!("model requested unknown tool '{other}'");
                format!(
                    "Error: unknown tool '{other}'. Available tools: {}",
                    self.names().join(", ")
                )
            }
        }
    }
}

fn unavailable(tool: &str) -> String {
    format!("Error: tool '{tool}' is not available in this run")
}

/// A string input, or one of `keys` inside an object input.
fn text_input<'v>(input: &'v Value, keys: &[&str]) -> Option<&'v str> {
    let raw = match input {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => keys.iter().find_map(|k| map.get(*k).and_then(Value::as_str)),
        _ => None,
    };
    raw.map(str::trim).filter(|s| !s.is_empty())
}

async fn lookup_previous(memory: &MemoryIndex, input: &Value) -> String {
    let Some(concept) = text_input(input, &["concept", "query", "term"]) else {
        return "Error: lookup_previous needs a concept".to_string();
    };

    let category = input
        .get("category")
        .and_then(Value::as_str)
        .map(ChunkCategory::from_label);
    let page_range = match input.get("page_range").and_then(Value::as_str) {
        Some(r) => match r.parse::<PageRange>() {
            Ok(range) => Some(range),
            Err(e) => return format!("Error: {e}"),
        },
        None => None,
    };
    let filter = QueryFilter {
        category,
        page_range,
    };

    match memory.query(concept, &filter).await {
        Ok(hits) if hits.is_empty() => {
            format!("No information found about '{concept}' in previous slides.")
        }
        Ok(hits) => {
            let mut out = format!("### Information about '{concept}' from previous slides:\n\n");
            for hit in hits {
                out.push_str(&format!(
                    "**From Slide {}** ({}):\n\n{}\n\n---\n\n",
                    hit.chunk.page_number, hit.chunk.category, hit.chunk.content
                ));
            }
            out
        }
        Err(e) => format!("Error searching previous slides: {e}"),
    }
}

async fn run_search(search: &dyn SearchCapability, input: &Value) -> String {
    let Some(term) = text_input(input, &["term", "query"]) else {
        return "Error: search needs a term".to_string();
    };
    match search.search(term).await {
        Ok(snippet) => snippet,
        Err(e) => format!("Error performing search: {e}"),
    }
}

fn check_schema(schema: &SchemaCatalog, input: &Value) -> String {
    let Some(entity) = text_input(input, &["entity_type", "table", "module"]) else {
        return "Error: check_schema needs an entity type".to_string();
    };
    let result = schema.lookup(entity);
    serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string())
}
