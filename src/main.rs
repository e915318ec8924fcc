use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod aggregate;
mod anonymize;
mod caller;
mod config;
mod errors;
mod evaluators;
mod fixtures;
mod generator;
mod model_id;
mod models;
mod output;
mod runner;
mod scheduler;
mod store;
mod summary;

use crate::caller::{ModelCaller, OpenAiCaller};
use crate::config::RunConfig;
use crate::evaluators::embedding::{EmbeddingCache, FileEmbeddingCache, InMemoryEmbeddingCache, OpenAiEmbedder};
use crate::evaluators::{CoverageEvaluator, EmbeddingEvaluator, Evaluator, EvaluatorOrchestrator};
use crate::fixtures::FixtureSet;
use crate::generator::ResponseGenerator;
use crate::output::OutputFormat;
use crate::runner::Runner;
use crate::scheduler::CircuitBreakerScheduler;
use crate::store::FileResultStore;
use crate::summary::Summarizer;

/// LLM comparative evaluation CLI - generate responses across model variants, score and summarize them
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML or JSON run configuration
    run_file: PathBuf,

    /// Output format: plain or json
    #[arg(short, long, default_value = "plain")]
    output: OutputFormat,

    /// Verbose output - log progress for each stage and failed call
    #[arg(short, long)]
    verbose: bool,

    /// Label of this run, used in the result file name and for fixture selection
    #[arg(long, default_value = "default")]
    run_label: String,

    /// Directory results are stored under, one subdirectory per config id
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// JSON file of recorded responses to replay instead of calling models
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Skip the executive summary
    #[arg(long)]
    no_summary: bool,

    /// Rewrite the executive summary of a stored result file instead of running the config
    #[arg(long, value_name = "FILE_NAME", requires = "store_dir", conflicts_with = "no_summary")]
    resummarize: Option<String>,
}

/// `RUST_LOG` wins; otherwise `--verbose` selects info and the default is warn
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_evaluators(config: &RunConfig, caller: Arc<dyn ModelCaller>, args: &Args) -> Vec<Box<dyn Evaluator>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let mut evaluators: Vec<Box<dyn Evaluator>> = vec![Box::new(
        CoverageEvaluator::new(caller, config.provider.judge_model.clone())
            .with_concurrency(config.concurrency)
            .with_timeout(timeout),
    )];

    match OpenAiEmbedder::from_config(&config.provider) {
        Ok(embedder) => {
            let cache: Arc<dyn EmbeddingCache> = match &args.store_dir {
                Some(dir) => Arc::new(FileEmbeddingCache::new(dir.join(".embedding_cache"))),
                None => Arc::new(InMemoryEmbeddingCache::new()),
            };
            evaluators.push(Box::new(EmbeddingEvaluator::new(Arc::new(embedder), cache)));
        }
        Err(e) => warn!(error = %format!("{:#}", e), "Embedding evaluator unavailable"),
    }
    evaluators
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = RunConfig::from_file(&args.run_file)?;
    config.validate()?;

    let caller: Arc<dyn ModelCaller> = Arc::new(
        OpenAiCaller::from_config(&config.provider).context("Failed to create model client")?,
    );
    let timeout = Duration::from_secs(config.timeout_secs);

    let scheduler = Arc::new(CircuitBreakerScheduler::new(config.concurrency));
    let mut generator = ResponseGenerator::new(caller.clone(), scheduler.clone())
        .with_run_label(args.run_label.clone())
        .with_timeout(timeout);
    if let Some(path) = &args.fixtures {
        let fixtures = FixtureSet::from_file(path)?;
        generator = generator.with_fixtures(Arc::new(fixtures));
    }

    let orchestrator = EvaluatorOrchestrator::new(build_evaluators(&config, caller.clone(), &args));
    let mut runner = Runner::new(generator, orchestrator).with_run_label(args.run_label.clone());

    match (&config.provider.summarizer_model, args.no_summary) {
        (Some(model), false) => {
            runner = runner.with_summarizer(Summarizer::new(caller.clone(), model.clone()).with_timeout(timeout));
        }
        (None, false) => info!("No summarizer model configured; skipping executive summary"),
        (_, true) => {}
    }
    if let Some(dir) = &args.store_dir {
        runner = runner.with_store(Arc::new(FileResultStore::new(dir)));
    }

    let results = match &args.resummarize {
        Some(file_name) => runner.resummarize(&config.id, file_name).await?,
        None => runner.run(&config).await?,
    };

    for model in scheduler.tripped_models().await {
        let failures = scheduler.failure_count(&model).await;
        warn!(model = %model, failures, "Circuit breaker tripped during the run");
    }

    output::print_results(&results, args.output);

    Ok(())
}
