//! CLI `match` command: run the engine over two line-oriented text files.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use food_mapper::config::FoodMapperConfig;
use food_mapper::embedding::LocalModel;
use food_mapper::matching::{
    FallbackMode, MatchEngine, MatchResult, Phase, ProgressSink, RunConfig, RunOutcome,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per input row
    Json,
    /// Aligned columns for reading in a terminal
    Table,
}

#[derive(Debug, Args)]
pub struct MatchArgs {
    /// File with one input description per line
    #[arg(long)]
    pub input: PathBuf,
    /// File with one target description per line
    #[arg(long)]
    pub target: PathBuf,
    /// Minimum cosine similarity for a match, in [-1, 1]
    #[arg(long)]
    pub threshold: Option<f64>,
    /// Backend selection: auto, remote_only or local_only
    #[arg(long)]
    pub mode: Option<FallbackMode>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Lowercase and strip punctuation before embedding
    #[arg(long)]
    pub normalize: bool,
    /// Embed every target row even when texts repeat
    #[arg(long)]
    pub keep_duplicate_targets: bool,
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,
}

/// Progress bar fed by the batch orchestrator.
struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {msg:>8} {bar:40.cyan/blue} {pos}/{len} batches ({eta})")?
                .progress_chars("##-"),
        );
        Ok(Self { bar })
    }
}

impl ProgressSink for IndicatifProgress {
    fn on_batch(&self, phase: Phase, completed: usize, total: usize) {
        if completed == 0 {
            self.bar.set_message(phase.as_str());
            self.bar.set_length(total as u64);
        }
        self.bar.set_position(completed as u64);
    }
}

/// Run one matching job and print the results to stdout.
pub async fn run_match(config: &FoodMapperConfig, args: &MatchArgs) -> Result<()> {
    let inputs = read_lines(&args.input)?;
    let targets = read_lines(&args.target)?;

    let mut config = config.clone();
    if let Some(mode) = args.mode {
        config.matching.fallback_mode = mode;
    }

    let mut run_config = RunConfig::from_config(&config);
    if let Some(threshold) = args.threshold {
        run_config.threshold = threshold;
    }
    if let Some(batch_size) = args.batch_size {
        run_config.batch_size = batch_size;
    }
    if let Some(concurrency) = args.concurrency {
        run_config.concurrency = concurrency;
    }
    run_config.normalize |= args.normalize;
    if args.keep_duplicate_targets {
        run_config.dedup_targets = false;
    }

    let local = Arc::new(LocalModel::from_config(&config.embedding));
    let progress = Arc::new(IndicatifProgress::new()?);
    let engine = MatchEngine::from_config(&config, Arc::clone(&local))
        .context("failed to set up embedding backends")?
        .with_progress(progress.clone());

    let cancel = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // no signal handler available: never cancel
            std::future::pending::<()>().await;
        }
    };

    let outcome = engine
        .run_until(&inputs, &targets, &run_config, cancel)
        .await;
    progress.bar.finish_and_clear();
    local.dispose();

    let outcome = outcome.context("matching run failed")?;

    match args.format {
        OutputFormat::Json => print_json(&outcome.results)?,
        OutputFormat::Table => print_table(&outcome.results, &inputs),
    }
    print_summary(&outcome);
    Ok(())
}

/// Non-blank lines of a UTF-8 text file, trailing `\r` removed.
fn read_lines(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(contents
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

fn print_json(results: &[MatchResult]) -> Result<()> {
    for result in results {
        println!("{}", serde_json::to_string(result)?);
    }
    Ok(())
}

fn print_table(results: &[MatchResult], inputs: &[String]) {
    println!("{:<6} {:<40} {:<40} {:>7} {}", "row", "input", "best target", "score", "match");
    println!("{}", "-".repeat(102));
    for result in results {
        let input = inputs
            .get(result.input_row_id)
            .map(String::as_str)
            .unwrap_or("");
        println!(
            "{:<6} {:<40} {:<40} {:>7.4} {}",
            result.input_row_id,
            preview(input, 40),
            preview(result.target_text.as_deref().unwrap_or("-"), 40),
            result.similarity_score,
            if result.is_match { "yes" } else { "no" },
        );
    }
}

fn preview(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let cut: String = text.chars().take(width - 3).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

fn print_summary(outcome: &RunOutcome) {
    let summary = &outcome.summary;
    let stats = &outcome.stats;
    eprintln!();
    eprintln!("Backend:           {}", outcome.backend);
    if let Some(reason) = stats.fallback_reason {
        eprintln!("Fallback reason:   {reason}");
    }
    eprintln!(
        "Batches:           {} remote, {} local, {} replayed",
        stats.remote_batches, stats.local_batches, stats.replayed_batches
    );
    eprintln!("Rows:              {}", summary.total);
    eprintln!("Matched:           {}", summary.matched);
    eprintln!("Unmatched:         {}", summary.unmatched);
    match summary.mean_matched_score {
        Some(mean) => eprintln!("Mean match score:  {mean:.4}"),
        None => eprintln!("Mean match score:  -"),
    }
}
