//! CLI binary for pharmdeck.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, draws a progress bar and prints the outcome.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pharmdeck::progress::ProgressCallback;
use pharmdeck::{
    inspect, run, ExportOutcome, ExtractionProgressCallback, PipelineConfig, RunStatus,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per slide.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    /// Per-slide provider outcomes, printed with the slide's line.
    providers: Mutex<HashMap<usize, Vec<(String, bool)>>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_run_start` tells us the slide count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rendering slides…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize, done: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} slides  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed(&self, page: usize) -> String {
        let ms = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&page))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        dim(&format!("{:.1}s", ms as f64 / 1000.0))
    }

    fn provider_marks(&self, page: usize) -> String {
        let seen = self
            .providers
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&page))
            .unwrap_or_default();
        seen.iter()
            .map(|(id, ok)| if *ok { green(id) } else { red(id) })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize, resumed_pages: usize) {
        self.activate_bar(total_pages, resumed_pages);
        let resumed = if resumed_pages > 0 {
            format!(" ({resumed_pages} restored from checkpoint)")
        } else {
            String::new()
        };
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total_pages} slides{resumed}…"))
        ));
    }

    fn on_page_start(&self, page_number: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(page_number, Instant::now());
        }
        self.bar.set_message(format!("slide {page_number}"));
    }

    fn on_provider_result(&self, page_number: usize, provider_id: &str, ok: bool) {
        if let Ok(mut m) = self.providers.lock() {
            m.entry(page_number)
                .or_default()
                .push((provider_id.to_string(), ok));
        }
    }

    fn on_page_complete(&self, page_number: usize, total: usize, source_count: usize) {
        self.bar.println(format!(
            "  {} Slide {:>3}/{:<3}  {}  {}  {}",
            green("✓"),
            page_number,
            total,
            dim(&format!("{source_count} source(s)")),
            self.provider_marks(page_number),
            self.elapsed(page_number),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_number: usize, total: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}…", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Slide {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_number,
            total,
            red(&msg),
            self.elapsed(page_number),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} slides extracted",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} slides extracted  ({} failed)",
                if failed == total_pages { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One provider, auto-detected from the environment
  pharmdeck deck.pdf

  # Three extractors, Claude as aggregator
  pharmdeck deck.pdf -p gemini:gemini-2.0-flash -p openai:gpt-4.1 \
      -p anthropic:claude-sonnet-4-20250514 --aggregator claude-sonnet-4-20250514

  # Document context for the prompts
  pharmdeck deck.pdf --company "Acme Pharma" --event "JPM 2025" --date 2025-01-13

  # Resume an interrupted run
  pharmdeck deck.pdf -p gpt-4.1 -p gemini-2.0-flash --resume

  # Inspect metadata only (no API key needed)
  pharmdeck --inspect-only deck.pdf

  # Full run output as JSON
  pharmdeck --json deck.pdf > run.json

PROVIDER SPECS:
  provider:model         openai:gpt-4.1, anthropic:claude-sonnet-4-20250514,
                         gemini:gemini-2.0-flash, ollama:llava
  bare model name        gemini-* → Google style, claude-* → Anthropic style,
                         gpt-* / o1 / o3 … → OpenAI style

TOOLS OFFERED TO PROVIDERS:
  lookup_previous   semantic memory of earlier slides
  search            Tavily web search (needs TAVILY_API_KEY)
  check_schema      pharma database schema reference

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key (also used for embeddings)
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  TAVILY_API_KEY          Enables the search tool
  EDGEQUAKE_LLM_PROVIDER  Provider used when no -p is given
  EDGEQUAKE_MODEL         Model used when no -p is given
  PDFIUM_LIB_PATH         Path to libpdfium
  RUST_LOG                Log filter (overrides -v / -q)
"#;

/// Extract pharmaceutical facts from slide decks with several vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pharmdeck",
    version,
    about = "Extract pharmaceutical facts from slide decks with several vision LLMs",
    long_about = "Render every slide of a PDF deck, extract pharmaceutical facts with one or \
more vision LLMs, merge their answers with an aggregator model, and write one markdown \
section per slide.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Extraction provider spec; repeat for several (fan-out order).
    #[arg(short, long = "provider", env = "PHARMDECK_PROVIDERS", value_delimiter = ',')]
    providers: Vec<String>,

    /// Aggregator provider spec. Default: the first provider.
    #[arg(short, long, env = "PHARMDECK_AGGREGATOR")]
    aggregator: Option<String>,

    /// Directory for the export and checkpoints.
    #[arg(short, long, env = "PHARMDECK_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Keep the export in memory and print it to stdout; no files written.
    #[arg(long, conflicts_with = "resume")]
    stdout: bool,

    /// Presenting company, used in prompts.
    #[arg(long, env = "PHARMDECK_COMPANY")]
    company: Option<String>,

    /// Event or venue, used in prompts.
    #[arg(long, env = "PHARMDECK_EVENT")]
    event: Option<String>,

    /// Presentation date, used in prompts.
    #[arg(long, env = "PHARMDECK_DATE")]
    date: Option<String>,

    /// Previous slides quoted in each prompt.
    #[arg(long, env = "PHARMDECK_CONTEXT_WINDOW", default_value_t = 3)]
    context_window: usize,

    /// Memory lookup result count (3–5).
    #[arg(long, env = "PHARMDECK_TOP_K", default_value_t = 3,
          value_parser = clap::value_parser!(u16).range(3..=5))]
    top_k: u16,

    /// Maximum model calls per tool-augmented extraction.
    #[arg(long, env = "PHARMDECK_MAX_TOOL_STEPS", default_value_t = 25)]
    max_tool_steps: usize,

    /// Do not offer tools; one model call per provider per slide.
    #[arg(long, env = "PHARMDECK_NO_TOOLS")]
    no_tools: bool,

    /// Schema reference catalogue (JSON) for the check_schema tool.
    #[arg(long, env = "PHARMDECK_SCHEMA")]
    schema: Option<PathBuf>,

    /// Tavily API key for the search tool.
    #[arg(long, env = "TAVILY_API_KEY", hide_env_values = true)]
    tavily_api_key: Option<String>,

    /// OpenAI embedding model for the memory index.
    #[arg(long, env = "PHARMDECK_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Use local hashing embeddings instead of the OpenAI API.
    #[arg(long, env = "PHARMDECK_LOCAL_EMBEDDINGS")]
    local_embeddings: bool,

    /// Restore a matching checkpoint and continue.
    #[arg(long)]
    resume: bool,

    /// Do not write per-slide checkpoints.
    #[arg(long)]
    no_checkpoint: bool,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PHARMDECK_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// PDF user password for encrypted decks.
    #[arg(long, env = "PHARMDECK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Max output tokens per model call.
    #[arg(long, env = "PHARMDECK_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "PHARMDECK_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Per-call model timeout in seconds.
    #[arg(long, env = "PHARMDECK_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PHARMDECK_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the full run output as JSON instead of the export.
    #[arg(long, env = "PHARMDECK_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "PHARMDECK_NO_PROGRESS")]
    no_progress: bool,

    /// Print document metadata only.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PHARMDECK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PHARMDECK_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the feedback; library INFO logs would only
    // tear it.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let config = base_builder(&cli).build().context("Invalid configuration")?;
        let meta = inspect(&cli.input, &config)
            .await
            .context("Failed to inspect deck")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialise metadata")?
            );
        } else {
            println!("File:      {}", cli.input);
            println!("Title:     {}", meta.title);
            if let Some(ref a) = meta.author {
                println!("Author:    {}", a);
            }
            if let Some(ref s) = meta.subject {
                println!("Subject:   {}", s);
            }
            println!("Company:   {}", meta.company);
            println!("Event:     {}", meta.event);
            println!("Date:      {}", meta.date);
            println!("Slides:    {}", meta.page_count);
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Run ──────────────────────────────────────────────────────────────
    let output = run(&cli.input, &config).await.context("Extraction failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if matches!(output.export_outcome, ExportOutcome::InMemory) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.export.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !cli.quiet && !cli.json {
        match &output.export_outcome {
            ExportOutcome::Written { path } => eprintln!(
                "{}  {}/{} slides  {}ms  →  {}",
                if output.stats.failed_pages == 0 { green("✔") } else { cyan("⚠") },
                output.stats.processed_pages,
                output.stats.total_pages,
                output.stats.total_duration_ms,
                bold(&path.display().to_string()),
            ),
            ExportOutcome::InMemory => {}
            ExportOutcome::NothingExtracted => {
                eprintln!("{} Nothing extracted; no file written", red("✘"))
            }
        }
        match &output.status {
            RunStatus::Complete => {}
            RunStatus::CompleteWithWarnings { warnings } => {
                for w in warnings {
                    eprintln!("   {} {}", yellow("!"), w);
                }
            }
            RunStatus::Aborted { anomaly } => {
                eprintln!("   {} run aborted: {}", red("✘"), anomaly);
            }
        }
        eprintln!(
            "   {}",
            dim(&format!(
                "{} memory chunks, {} degraded, {} restored",
                output.stats.memory_chunks, output.stats.degraded_pages, output.stats.resumed_pages
            ))
        );
    }

    Ok(())
}

/// Settings shared by every mode.
fn base_builder(cli: &Cli) -> pharmdeck::PipelineConfigBuilder {
    let mut builder = PipelineConfig::builder()
        .dpi(cli.dpi)
        .download_timeout_secs(cli.download_timeout);
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd);
    }
    if let Some(ref c) = cli.company {
        builder = builder.company(c);
    }
    if let Some(ref e) = cli.event {
        builder = builder.event(e);
    }
    if let Some(ref d) = cli.date {
        builder = builder.date(d);
    }
    builder
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = base_builder(cli)
        .providers(&cli.providers)
        .context_window(cli.context_window)
        .memory_top_k(cli.top_k as usize)
        .max_tool_steps(cli.max_tool_steps)
        .enable_tools(!cli.no_tools)
        .embedding_model(&cli.embedding_model)
        .local_embeddings(cli.local_embeddings)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .api_timeout_secs(cli.api_timeout)
        .checkpoint(!cli.no_checkpoint)
        .resume(cli.resume);

    builder = if cli.stdout {
        builder.no_output_dir()
    } else {
        builder.output_dir(&cli.output_dir)
    };
    if let Some(ref agg) = cli.aggregator {
        builder = builder.aggregator(agg);
    }
    if let Some(ref path) = cli.schema {
        builder = builder.schema_path(path);
    }
    if let Some(ref key) = cli.tavily_api_key {
        builder = builder.tavily_api_key(key);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
