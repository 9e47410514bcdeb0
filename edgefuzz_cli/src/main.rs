use edgefuzz_core::config::{EdgefuzzConfig, FuzzerSettings};
use edgefuzz_core::dictionary::load_dictionary_file;
use edgefuzz_core::executor::CommandExecutor;
use edgefuzz_core::fuzzer::{Fuzzer, FuzzerOptions};
use edgefuzz_core::mutator::ByteMutator;
use edgefuzz_core::rng::FuzzRng;
use edgefuzz_core::storage::ArtifactStore;

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults to ./edgefuzz.toml when present.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuzz the target starting from the seed corpus.
    Fuzz(SessionArgs),
    /// Run the corpus once and write the coverage report.
    Coverage {
        #[clap(flatten)]
        session: SessionArgs,
        #[clap(long)]
        coverage_dir: Option<PathBuf>,
    },
    /// Shrink a crashing input while it keeps crashing.
    Minimize {
        crash_file: PathBuf,
        #[clap(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args, Debug, Default)]
struct SessionArgs {
    #[clap(long)]
    corpus_dir: Option<PathBuf>,
    #[clap(long)]
    output_dir: Option<PathBuf>,
    /// Stop after this many target executions.
    #[clap(short, long)]
    runs: Option<u64>,
    /// Stop after this many seconds.
    #[clap(long)]
    max_time: Option<u64>,
    #[clap(long)]
    max_crashes: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    /// Target command line, after `--`.
    #[clap(last = true)]
    target: Vec<String>,
}

impl SessionArgs {
    fn apply(&self, config: &mut EdgefuzzConfig) {
        if let Some(dir) = &self.corpus_dir {
            config.corpus.corpus_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.output_dir {
            config.corpus.output_dir = dir.clone();
        }
        if let Some(runs) = self.runs {
            config.fuzzer.max_runs = Some(runs);
        }
        if let Some(secs) = self.max_time {
            config.fuzzer.max_time_secs = Some(secs);
        }
        if let Some(max_crashes) = self.max_crashes {
            config.fuzzer.max_crashes = max_crashes;
        }
        if let Some(seed) = self.seed {
            config.fuzzer.seed = Some(seed);
        }
        if !self.target.is_empty() {
            config.executor.command = self.target.clone();
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EdgefuzzConfig> {
    match path {
        Some(path) => {
            log::info!("Loading configuration from {path:?}");
            EdgefuzzConfig::load_from_file(path)
        }
        None => {
            let default_path = Path::new("edgefuzz.toml");
            if default_path.exists() {
                log::info!("Loading default configuration {default_path:?}");
                EdgefuzzConfig::load_from_file(default_path)
            } else {
                Ok(EdgefuzzConfig::default())
            }
        }
    }
}

fn load_dictionary(settings: &FuzzerSettings) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut tokens: Vec<Vec<u8>> = settings.dictionary.iter().map(|t| t.as_bytes().to_vec()).collect();
    for path in &settings.dictionary_files {
        let file_tokens =
            load_dictionary_file(path).with_context(|| format!("Invalid dictionary file {path:?}"))?;
        tokens.extend(file_tokens);
    }
    Ok(tokens)
}

fn build_fuzzer(config: &EdgefuzzConfig) -> anyhow::Result<Fuzzer> {
    let corpus_dir = config
        .corpus
        .corpus_dir
        .clone()
        .ok_or_else(|| anyhow!("Missing corpus directory (set corpus-dir or pass --corpus-dir)"))?;
    let exec_config = config
        .command_executor_config()
        .ok_or_else(|| anyhow!("Missing target command (set executor.command or pass it after --)"))?;

    let executor = CommandExecutor::new(exec_config)?;
    let mutator = ByteMutator::new(load_dictionary(&config.fuzzer)?);
    let scheduler = config.fuzzer.scheduler.build();
    let store = ArtifactStore::new(corpus_dir, config.corpus.output_dir.clone());
    let rng = match config.fuzzer.seed {
        Some(seed) => FuzzRng::with_seed(seed),
        None => FuzzRng::from_entropy(),
    };
    log::info!("Using seed {}", rng.seed());

    let fuzzer = Fuzzer::new(
        Box::new(executor),
        Box::new(mutator),
        scheduler,
        store,
        rng,
        FuzzerOptions::from(&config.fuzzer),
    );
    let stop = fuzzer.stop_handle();
    ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
        .context("Failed to install interrupt handler")?;
    Ok(fuzzer)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config_file.as_deref())?;

    match cli.command {
        Command::Fuzz(session) => {
            session.apply(&mut config);
            let mut fuzzer = build_fuzzer(&config)?;
            fuzzer.load_corpus()?;
            let summary = fuzzer.fuzz()?;
            log::info!(
                "Done after {} runs: corpus {} entries, {} features ({} new), {} unique crashes",
                summary.runs,
                summary.corpus_len,
                summary.features,
                summary.new_features,
                summary.unique_crashes
            );
        }
        Command::Coverage { session, coverage_dir } => {
            session.apply(&mut config);
            if let Some(dir) = coverage_dir {
                config.corpus.coverage_dir = Some(dir);
            }
            let coverage_dir = config
                .corpus
                .coverage_dir
                .clone()
                .ok_or_else(|| anyhow!("Missing coverage directory"))?;
            let mut fuzzer = build_fuzzer(&config)?;
            fuzzer.load_corpus()?;
            let report = fuzzer.coverage_report();
            let path = report.write_to(&coverage_dir)?;
            match report.edge_coverage() {
                Some(ratio) => log::info!(
                    "Wrote coverage report to {path:?}: {} edges covered ({:.1}%)",
                    report.covered_edges.len(),
                    ratio * 100.0
                ),
                None => log::info!(
                    "Wrote coverage report to {path:?}: {} edges covered",
                    report.covered_edges.len()
                ),
            }
        }
        Command::Minimize { crash_file, session } => {
            session.apply(&mut config);
            if !crash_file.is_file() {
                return Err(anyhow!("Crash input {crash_file:?} does not exist"));
            }
            // seeds are not read while minimizing
            if config.corpus.corpus_dir.is_none() {
                config.corpus.corpus_dir = Some(config.corpus.output_dir.clone());
            }
            let mut fuzzer = build_fuzzer(&config)?;
            match fuzzer.minimize_crash(&crash_file)? {
                Some(path) => log::info!("Smallest reproducer: {path:?}"),
                None => log::info!("No smaller crashing input found"),
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
