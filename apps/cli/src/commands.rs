//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use topicsync_core::{
    PathSummarizer, ProgressReporter, StoreReferenceChecker, SyncConfig, SyncReport, SyncState,
    TitleFilter,
};
use topicsync_embedding::{EmbedderOptions, OpenAiEmbedder};
use topicsync_outline::{OutlineOptions, ParsedBatch, parse_flat_json, parse_outline};
use topicsync_shared::{
    AppConfig, SubjectKey, init_config, load_config, load_config_from, validate_api_key,
};
use topicsync_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// topicsync: curriculum topic trees with stable identities.
#[derive(Parser)]
#[command(
    name = "topicsync",
    version,
    about = "Synchronize curriculum topic trees into a production store and embedding index.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.topicsync/topicsync.toml).
    #[arg(long, global = true, env = "TOPICSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file, overriding `defaults.database_path`.
    #[arg(long, global = true, env = "TOPICSYNC_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Identifies one subject partition.
#[derive(Args, Debug, Clone)]
pub(crate) struct SubjectArgs {
    /// Exam board, e.g. AQA.
    #[arg(long)]
    pub board: String,

    /// Qualification, e.g. A-Level.
    #[arg(long)]
    pub qualification: String,

    /// Subject code, e.g. ECON. Also the default topic code prefix.
    #[arg(long)]
    pub subject: String,

    /// Display name stored on the subject and its embedding records.
    #[arg(long)]
    pub subject_name: Option<String>,
}

impl SubjectArgs {
    fn key(&self) -> SubjectKey {
        SubjectKey::new(&self.board, &self.qualification, &self.subject)
    }
}

/// Where staging topics come from.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub(crate) struct InputArgs {
    /// Numbered outline text file.
    #[arg(long)]
    pub outline: Option<PathBuf>,

    /// JSON array of `{code, title, level, parent_code}` records.
    #[arg(long)]
    pub flat: Option<PathBuf>,
}

/// Controls for the embedding phase.
#[derive(Args, Debug, Clone)]
pub(crate) struct IndexArgs {
    /// Skip the embedding phase.
    #[arg(long)]
    pub no_embeddings: bool,

    /// Store a short summary with every embedding record.
    #[arg(long)]
    pub summaries: bool,

    /// Version tag for embedding records (defaults to a tree fingerprint).
    #[arg(long)]
    pub spec_version: Option<String>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Parse input, stage it, promote it, and refresh the index.
    Sync {
        #[command(flatten)]
        subject: SubjectArgs,
        #[command(flatten)]
        input: InputArgs,
        /// Topic code prefix for outlines (defaults to the subject code).
        #[arg(long)]
        prefix: Option<String>,
        /// Keep the staging batch after promotion.
        #[arg(long)]
        keep_staging: bool,
        #[command(flatten)]
        index: IndexArgs,
    },

    /// Parse input and replace the subject's staging batch.
    Stage {
        #[command(flatten)]
        subject: SubjectArgs,
        #[command(flatten)]
        input: InputArgs,
        /// Topic code prefix for outlines (defaults to the subject code).
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Promote the subject's current staging batch.
    Promote {
        #[command(flatten)]
        subject: SubjectArgs,
        /// Keep the staging batch after promotion.
        #[arg(long)]
        keep_staging: bool,
        #[command(flatten)]
        index: IndexArgs,
    },

    /// Rebuild the embedding index from current production topics.
    Embed {
        #[command(flatten)]
        subject: SubjectArgs,
        /// Store a short summary with every embedding record.
        #[arg(long)]
        summaries: bool,
        /// Version tag for embedding records.
        #[arg(long)]
        spec_version: Option<String>,
    },

    /// Parse input and print the staging topics as JSON.
    Parse {
        #[command(flatten)]
        input: InputArgs,
        /// Topic code prefix for outlines.
        #[arg(long, default_value = "T")]
        prefix: String,
    },

    /// Show subjects and their topic, staging, and index counts.
    Status,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "topicsync=info",
        1 => "topicsync=debug",
        _ => "topicsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let ctx = Context {
        config_path: cli.config,
        db: cli.db,
    };

    match cli.command {
        Command::Sync {
            subject,
            input,
            prefix,
            keep_staging,
            index,
        } => cmd_sync(&ctx, &subject, &input, prefix.as_deref(), keep_staging, &index).await,
        Command::Stage {
            subject,
            input,
            prefix,
        } => cmd_stage(&ctx, &subject, &input, prefix.as_deref()).await,
        Command::Promote {
            subject,
            keep_staging,
            index,
        } => cmd_promote(&ctx, &subject, keep_staging, &index).await,
        Command::Embed {
            subject,
            summaries,
            spec_version,
        } => cmd_embed(&ctx, &subject, summaries, spec_version.as_deref()).await,
        Command::Parse { input, prefix } => cmd_parse(&ctx, &input, &prefix),
        Command::Status => cmd_status(&ctx).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&ctx),
        },
    }
}

/// Global flags every command resolves against.
struct Context {
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
}

impl Context {
    fn config(&self) -> Result<AppConfig> {
        let config = match &self.config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        Ok(config)
    }

    fn db_path(&self, config: &AppConfig) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.defaults.database_path))
    }

    async fn open_storage(&self, config: &AppConfig) -> Result<Storage> {
        let path = self.db_path(config);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("cannot create {}: {e}", parent.display()))?;
        }
        Ok(Storage::open(&path).await?)
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_sync(
    ctx: &Context,
    subject: &SubjectArgs,
    input: &InputArgs,
    prefix: Option<&str>,
    keep_staging: bool,
    index: &IndexArgs,
) -> Result<()> {
    let config = ctx.config()?;
    // Fail on a missing key before any store write
    let embedder = build_embedder(&config, index)?;
    let batch = read_batch(&config, input, prefix.unwrap_or(&subject.subject))?;

    let storage = ctx.open_storage(&config).await?;
    let key = subject.key();
    let staged = topicsync_core::stage_batch(&storage, &key, subject.subject_name.as_deref(), &batch).await?;
    info!(subject = %key, staged = staged.staged, skipped = staged.skipped, "staged topics");

    let report = promote(&config, &storage, &key, keep_staging, index, embedder.as_ref()).await?;
    print_sync_report(&key, &report, Some(batch.skipped));
    finish(&report)
}

async fn cmd_stage(ctx: &Context, subject: &SubjectArgs, input: &InputArgs, prefix: Option<&str>) -> Result<()> {
    let config = ctx.config()?;
    let batch = read_batch(&config, input, prefix.unwrap_or(&subject.subject))?;
    let storage = ctx.open_storage(&config).await?;
    let key = subject.key();

    let report = topicsync_core::stage_batch(&storage, &key, subject.subject_name.as_deref(), &batch).await?;

    println!();
    println!("  Staged {} topics for {key}", report.staged);
    println!("  Batch:     {}", report.batch_id);
    println!("  Skipped:   {}", report.skipped);
    println!("  Truncated: {}", report.truncated);
    println!();
    Ok(())
}

async fn cmd_promote(ctx: &Context, subject: &SubjectArgs, keep_staging: bool, index: &IndexArgs) -> Result<()> {
    let config = ctx.config()?;
    let embedder = build_embedder(&config, index)?;
    let storage = ctx.open_storage(&config).await?;
    let key = subject.key();

    let report = promote(&config, &storage, &key, keep_staging, index, embedder.as_ref()).await?;
    print_sync_report(&key, &report, None);
    finish(&report)
}

async fn cmd_embed(ctx: &Context, subject: &SubjectArgs, summaries: bool, spec_version: Option<&str>) -> Result<()> {
    let config = ctx.config()?;
    let api_key = validate_api_key(&config)?;
    let embedder = OpenAiEmbedder::new(EmbedderOptions::from_config(&config.embedding, api_key))?;
    let storage = ctx.open_storage(&config).await?;
    let key = subject.key();

    let summarizer = (summaries || config.summaries.enabled)
        .then(|| PathSummarizer::new(config.summaries.max_chars));
    let reporter = CliProgress::new();

    let report = topicsync_core::reindex_subject(
        &storage,
        &key,
        &embedder,
        summarizer.as_ref(),
        spec_version,
        &reporter,
    )
    .await;
    reporter.finish();
    let report = report?;

    println!();
    println!("  Embedding index rebuilt for {key}");
    println!("  Records:   {}", report.written);
    println!("  Batches:   {}", report.batches);
    println!("  Summaries: {}", report.summaries);
    println!();
    Ok(())
}

fn cmd_parse(ctx: &Context, input: &InputArgs, prefix: &str) -> Result<()> {
    let config = ctx.config()?;
    let batch = read_batch(&config, input, prefix)?;
    info!(topics = batch.topics.len(), skipped = batch.skipped, truncated = batch.truncated, "parsed input");
    println!("{}", serde_json::to_string_pretty(&batch.topics)?);
    Ok(())
}

async fn cmd_status(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    let path = ctx.db_path(&config);
    if !path.exists() {
        return Err(eyre!("no database at {}; run `topicsync sync` first", path.display()));
    }
    let storage = Storage::open_readonly(&path).await?;

    let subjects = storage.list_subjects().await?;
    if subjects.is_empty() {
        println!("No subjects.");
        return Ok(());
    }

    println!();
    println!("  {:<36} {:>7} {:>8} {:>9}", "SUBJECT", "TOPICS", "STAGING", "INDEXED");
    for subject in subjects {
        let topics = storage.count_topics(&subject.id).await?;
        let staging = storage.list_staging_topics(&subject.id).await?.len();
        let indexed = storage.count_embeddings(&subject.id).await?;
        let label = format!("{}/{}/{}", subject.exam_board, subject.qualification, subject.code);
        println!("  {label:<36} {topics:>7} {staging:>8} {indexed:>9}");
    }
    println!();
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_batch(config: &AppConfig, input: &InputArgs, prefix: &str) -> Result<ParsedBatch> {
    let (path, outline) = match (&input.outline, &input.flat) {
        (Some(path), _) => (path.as_path(), true),
        (None, Some(path)) => (path.as_path(), false),
        (None, None) => return Err(eyre!("pass --outline or --flat")),
    };
    let text = read_input(path)?;

    if outline {
        let opts = OutlineOptions {
            code_prefix: prefix.to_string(),
            level_offset: config.defaults.level_offset,
            level_cap: Some(config.defaults.level_cap),
        };
        Ok(parse_outline(&text, &opts))
    } else {
        Ok(parse_flat_json(&text)?)
    }
}

fn read_input(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| eyre!("cannot read {}: {e}", path.display()))
}

/// `None` when the embedding phase is switched off.
fn build_embedder(config: &AppConfig, index: &IndexArgs) -> Result<Option<OpenAiEmbedder>> {
    if index.no_embeddings || !config.embedding.enabled {
        return Ok(None);
    }
    let api_key = validate_api_key(config)?;
    let embedder = OpenAiEmbedder::new(EmbedderOptions::from_config(&config.embedding, api_key))?;
    Ok(Some(embedder))
}

async fn promote(
    config: &AppConfig,
    storage: &Storage,
    key: &SubjectKey,
    keep_staging: bool,
    index: &IndexArgs,
    embedder: Option<&OpenAiEmbedder>,
) -> Result<SyncReport> {
    let sync_config = SyncConfig {
        title_filter: TitleFilter::from_config(&config.filters)?,
        keep_staging: keep_staging || config.defaults.keep_staging,
        spec_version: index.spec_version.clone(),
    };
    let checker = StoreReferenceChecker::new(storage, config.safety.reference_tables.clone());
    let summarizer = (index.summaries || config.summaries.enabled)
        .then(|| PathSummarizer::new(config.summaries.max_chars));
    let reporter = CliProgress::new();

    let report = topicsync_core::sync_subject(
        &sync_config,
        storage,
        key,
        &checker,
        embedder,
        summarizer.as_ref(),
        &reporter,
    )
    .await;
    reporter.finish();
    Ok(report?)
}

fn print_sync_report(key: &SubjectKey, report: &SyncReport, skipped_lines: Option<usize>) {
    println!();
    println!("  Synchronized {key} ({})", report.final_state);
    if let Some(skipped) = skipped_lines {
        println!("  Skipped lines:   {skipped}");
    }
    println!("  Staged:          {}", report.staged);
    println!(
        "  Filtered:        {} ({} reparented, {} orphaned)",
        report.tree.filtered, report.tree.reparented, report.tree.orphaned
    );
    println!(
        "  Matched:         {} ({} by code, {} by title)",
        report.matched(),
        report.promote.matched_by_code,
        report.promote.matched_by_title
    );
    println!("  Inserted:        {}", report.promote.inserted);
    println!("  Parent-linked:   {}", report.promote.parents_linked);
    println!("  Deleted:         {}", report.promote.deleted);
    println!("  Kept (in use):   {}", report.promote.kept_referenced);
    println!("  Write failures:  {}", report.promote.write_failures);
    if report.embeddings_skipped {
        println!("  Embeddings:      skipped");
    } else {
        println!("  Embeddings:      {}", report.embeddings_written());
        println!("  Embed failures:  {}", report.embedding_failures);
        println!("  Spec version:    {}", report.spec_version);
    }
    println!("  Topics:          {}", report.topic_count);
    println!("  Time:            {:.1}s", report.elapsed.as_secs_f64());
    println!();

    for violation in &report.violations {
        warn!(%violation, "tree violation after promotion");
    }
}

/// Turn an embedding-phase failure into a non-zero exit.
fn finish(report: &SyncReport) -> Result<()> {
    match &report.embedding_error {
        Some(e) => Err(eyre!("embedding phase failed, topic tree was promoted: {e}")),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .map(|s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]))
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn state(&self, state: SyncState) {
        let message = match state {
            SyncState::Parsed => "Reading staging batch",
            SyncState::TreeBuilt => "Resolving topic identities",
            SyncState::IdentityResolved => "Writing topics",
            SyncState::ParentsLinked => "Checking removed topics",
            SyncState::DeletionsApplied => "Embedding topics",
            SyncState::EmbeddingsRefreshed | SyncState::Done => "Finishing",
        };
        self.spinner.set_message(message);
    }

    fn batch_embedded(&self, current: usize, total: usize) {
        self.spinner.set_message(format!("Embedding [{current}/{total}]"));
    }

    fn done(&self, _report: &SyncReport) {
        self.spinner.finish_and_clear();
    }
}
