use crate::config::FuzzerSettings;
use crate::corpus::{Corpus, CrashDedup};
use crate::entry::{CorpusEntry, EntryId};
use crate::executor::{ExecutionResult, Executor, ExecutorError};
use crate::feature::{FeatureSet, features_from_edge_counts};
use crate::mutator::Mutator;
use crate::report::{CoverageReport, ProgressEvent, ProgressStats, format_progress};
use crate::rng::FuzzRng;
use crate::scheduler::Scheduler;
use crate::storage::{ArtifactStore, StorageError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Inputs never start out longer than this unless the seeds are.
const MIN_INITIAL_MAX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum FuzzerError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Corpus input {path:?} crashed: {description}")]
    CorpusCrash { path: PathBuf, description: String },
    #[error("Crash input {0:?} did not crash")]
    CrashDidNotReproduce(PathBuf),
    #[error("Harness is broken: {0}")]
    HarnessBroken(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Executor(ExecutorError),
}

impl From<ExecutorError> for FuzzerError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::HarnessBroken(msg) => FuzzerError::HarnessBroken(msg),
            other => FuzzerError::Executor(other),
        }
    }
}

/// Tunables of a fuzzing or minimization session.
#[derive(Debug, Clone)]
pub struct FuzzerOptions {
    /// Stop after this many target executions.
    pub max_runs: Option<u64>,
    /// Stop after this much wall-clock time.
    pub max_time: Option<Duration>,
    /// Stop once this many crashes (duplicates included) were seen.
    pub max_crashes: u64,
    /// Ceiling for the adaptive candidate length.
    pub max_len: usize,
    /// Mutations chained on one base entry per iteration.
    pub mutation_depth: usize,
    /// Runs without progress, per `log2(current max len)`, before the length grows.
    pub len_control_factor: u64,
    /// Wall-clock limit for one execution.
    pub timeout: Duration,
    pub crash_dedup: CrashDedup,
}

impl Default for FuzzerOptions {
    fn default() -> Self {
        Self::from(&FuzzerSettings::default())
    }
}

impl From<&FuzzerSettings> for FuzzerOptions {
    fn from(settings: &FuzzerSettings) -> Self {
        Self {
            max_runs: settings.max_runs,
            max_time: settings.max_time(),
            max_crashes: settings.max_crashes,
            max_len: settings.max_len,
            mutation_depth: settings.mutation_depth,
            len_control_factor: settings.len_control_factor,
            timeout: settings.timeout(),
            crash_dedup: settings.crash_dedup,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    RunBudget,
    TimeBudget,
    CrashBudget,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub runs: u64,
    /// Every crash seen, duplicates included.
    pub crashes: u64,
    pub unique_crashes: usize,
    pub corpus_len: usize,
    pub features: usize,
    pub new_features: usize,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

/// Growth step for the adaptive max length: `floor(log2(len))`, at least 1.
fn len_step(len: usize) -> usize {
    (len.max(1).ilog2() as usize).max(1)
}

/// The coverage-guided fuzzing engine.
///
/// A `Fuzzer` owns the corpus and the session's random source and drives
/// everything from a single thread: pick an entry, mutate it, run it, classify
/// the result, persist artifacts. The corpus is only ever touched between
/// executions, so stopping between iterations is always safe.
///
/// Each input is written to the store's in-flight file before it runs. If the
/// host panics the input is stored as a crash on drop; if the process dies
/// without unwinding, the next session stores it when it starts.
pub struct Fuzzer {
    executor: Box<dyn Executor>,
    mutator: Box<dyn Mutator>,
    scheduler: Box<dyn Scheduler>,
    store: ArtifactStore,
    rng: FuzzRng,
    options: FuzzerOptions,
    corpus: Corpus,
    stop: Arc<AtomicBool>,
    runs: u64,
    crashes: u64,
    initial_features: usize,
    started: Instant,
}

impl Fuzzer {
    pub fn new(
        executor: Box<dyn Executor>,
        mutator: Box<dyn Mutator>,
        scheduler: Box<dyn Scheduler>,
        store: ArtifactStore,
        rng: FuzzRng,
        options: FuzzerOptions,
    ) -> Self {
        let corpus = Corpus::with_crash_dedup(options.crash_dedup);
        Self {
            executor,
            mutator,
            scheduler,
            store,
            rng,
            options,
            corpus,
            stop: Arc::new(AtomicBool::new(false)),
            runs: 0,
            crashes: 0,
            initial_features: 0,
            started: Instant::now(),
        }
    }

    /// Flag that stops the session at the next iteration boundary once set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Executes every seed once and builds the initial corpus from them.
    ///
    /// Seeds are added shortest first so short inputs become the owners of
    /// shared features. A crashing seed aborts with [`FuzzerError::CorpusCrash`].
    ///
    /// # Returns
    /// The number of seed files read.
    pub fn load_corpus(&mut self) -> Result<usize, FuzzerError> {
        self.recover_in_flight()?;
        let seeds = self.store.load_seeds()?;
        let num_seeds = seeds.len();

        let mut entries = Vec::with_capacity(num_seeds);
        for (path, input) in seeds {
            let edges = match self.run_input(&input)? {
                ExecutionResult::Ok(edges) => edges,
                ExecutionResult::Crashed(description) => {
                    log::warn!("CORPUS CRASH in {path:?}!\n{description}");
                    return Err(FuzzerError::CorpusCrash { path, description });
                }
            };
            let mut entry = CorpusEntry::new(input, features_from_edge_counts(&edges), None);
            entry.storage_path = Some(path);
            entries.push(entry);
        }

        entries.sort_by_key(CorpusEntry::len);
        for mut entry in entries {
            self.corpus.compute_unique_features(&mut entry);
            if !entry.unique_features.is_empty() && !self.corpus.contains_identity(&entry.identity) {
                self.corpus.add_entry(entry);
            }
        }
        self.initial_features = self.corpus.num_features();
        log::info!(
            "Loaded {} seeds from {:?}: {} corpus entries, {} features",
            num_seeds,
            self.store.corpus_dir(),
            self.corpus.len(),
            self.initial_features
        );
        Ok(num_seeds)
    }

    /// Runs the main fuzzing loop until a budget is exhausted or the session is interrupted.
    ///
    /// Seed executions done by [`Fuzzer::load_corpus`] do not count towards the run budget.
    pub fn fuzz(&mut self) -> Result<SessionSummary, FuzzerError> {
        if self.options.max_len == 0 {
            return Err(FuzzerError::Config("max-len must be at least 1".to_string()));
        }
        self.recover_in_flight()?;
        self.runs = 0;
        self.started = Instant::now();
        log::info!(
            "Fuzzing with seed {}, scheduler {}, max len {}",
            self.rng.seed(),
            self.scheduler.name(),
            self.options.max_len
        );

        let mut cur_max_len = self
            .options
            .max_len
            .min(self.corpus.max_len().max(MIN_INITIAL_MAX_LEN));
        let mut last_interesting_run = 0u64;
        let mut next_pulse = 1u64;

        let stop_reason = loop {
            if let Some(reason) = self.stop_reason() {
                break reason;
            }

            let base_id = self.scheduler.next(&self.corpus, &mut self.rng);
            let crossover_id = self.scheduler.next(&self.corpus, &mut self.rng);
            let base_input = base_id
                .and_then(|id| self.corpus.get(id))
                .map(|entry| entry.input.clone())
                .unwrap_or_default();
            let crossover = crossover_id
                .and_then(|id| self.corpus.get(id))
                .map(|entry| entry.input.clone());

            let mut candidate = base_input;
            for _ in 0..self.options.mutation_depth {
                candidate = self
                    .mutator
                    .mutate(&candidate, cur_max_len, crossover.as_deref(), &mut self.rng);
                let outcome = self.run_input(&candidate)?;

                if self.runs >= next_pulse {
                    next_pulse = next_pulse.saturating_mul(2);
                    self.log_progress(ProgressEvent::Pulse, candidate.len(), cur_max_len);
                }

                let edges = match outcome {
                    ExecutionResult::Crashed(description) => {
                        self.handle_crash(candidate.clone(), description)?;
                        break;
                    }
                    ExecutionResult::Ok(edges) => edges,
                };

                let mut entry = CorpusEntry::new(candidate.clone(), features_from_edge_counts(&edges), None);
                self.corpus.compute_unique_features(&mut entry);
                if !entry.unique_features.is_empty() {
                    if !self.corpus.contains_identity(&entry.identity) {
                        self.add_new_entry(entry)?;
                        self.log_progress(ProgressEvent::New, candidate.len(), cur_max_len);
                    }
                    last_interesting_run = self.runs;
                    break;
                }

                if let Some(base_id) = base_id {
                    if self.try_reduce(base_id, entry)? {
                        last_interesting_run = self.runs;
                        self.log_progress(ProgressEvent::Reduce, candidate.len(), cur_max_len);
                        break;
                    }
                }

                if self.run_budget_exhausted() {
                    break;
                }
            }

            if cur_max_len < self.options.max_len {
                let step = len_step(cur_max_len);
                let patience = self.options.len_control_factor.saturating_mul(step as u64);
                if self.runs - last_interesting_run > patience {
                    cur_max_len = self.options.max_len.min(cur_max_len + step);
                    last_interesting_run = self.runs;
                    log::debug!("no progress in {patience} runs, max len now {cur_max_len}");
                }
            }
        };

        self.log_progress(ProgressEvent::Done, 0, cur_max_len);
        let summary = self.summary(stop_reason);
        log::info!(
            "Session finished ({:?}): {} runs, {} crashes ({} unique)",
            summary.stop_reason,
            summary.runs,
            summary.crashes,
            summary.unique_crashes
        );
        Ok(summary)
    }

    /// Shrinks a known crashing input while it keeps crashing.
    ///
    /// Every strictly shorter crashing candidate is stored as
    /// `minimized-<identity>` in the output directory. Stops at the run or time
    /// budget, on interruption, or once the input is empty.
    ///
    /// # Returns
    /// The path of the smallest stored reproducer, or `None` if no shorter
    /// crashing input was found.
    pub fn minimize_crash(&mut self, path: &Path) -> Result<Option<PathBuf>, FuzzerError> {
        let input = std::fs::read(path).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.recover_in_flight()?;
        self.runs = 0;
        self.started = Instant::now();

        if let ExecutionResult::Ok(_) = self.run_input(&input)? {
            return Err(FuzzerError::CrashDidNotReproduce(path.to_path_buf()));
        }
        log::info!("Minimizing {} byte crash input {path:?}", input.len());

        let mut best = input;
        let mut last_stored = None;
        while !best.is_empty() && self.stop_reason().is_none() {
            let mut candidate = best.clone();
            for _ in 0..self.options.mutation_depth {
                candidate = self.mutator.mutate(&candidate, best.len(), None, &mut self.rng);
                if candidate.len() >= best.len() {
                    continue;
                }
                let ExecutionResult::Crashed(description) = self.run_input(&candidate)? else {
                    continue;
                };

                let entry = CorpusEntry::new(candidate.clone(), FeatureSet::new(), Some(description));
                let stored = self.store.minimized_path(&entry.identity);
                self.store.write(&stored, &entry.input)?;
                log::warn!(
                    "CRASH with length {} in {stored:?}!\n{}",
                    entry.len(),
                    entry.crash_description.as_deref().unwrap_or_default()
                );
                best = entry.input;
                last_stored = Some(stored);
                break;
            }
        }
        Ok(last_stored)
    }

    /// Coverage data for the current corpus.
    pub fn coverage_report(&self) -> CoverageReport {
        CoverageReport {
            seen_features: self.corpus.seen_features(),
            covered_edges: self.corpus.covered_edges(),
            instrumented_edges: self.executor.instrumented_edges(),
        }
    }

    fn run_input(&mut self, input: &[u8]) -> Result<ExecutionResult, FuzzerError> {
        let in_flight = self.store.in_flight_path();
        self.store.write(&in_flight, input)?;
        self.runs += 1;
        let result = self.executor.execute(input, self.options.timeout);
        self.store.remove(&in_flight)?;
        result.map_err(FuzzerError::from)
    }

    /// Stores an input whose execution never returned as a crash.
    fn recover_in_flight(&self) -> Result<(), FuzzerError> {
        self.store.create_output_dir()?;
        let Some(input) = self.store.take_in_flight()? else {
            return Ok(());
        };
        let entry = CorpusEntry::new(input, FeatureSet::new(), None);
        let path = self.store.crash_path(&entry.identity);
        self.store.write(&path, &entry.input)?;
        log::error!("CRASH in {path:?}!\nFatal error while executing input");
        Ok(())
    }

    fn handle_crash(&mut self, input: Vec<u8>, description: String) -> Result<(), FuzzerError> {
        self.crashes += 1;
        let entry = CorpusEntry::new(input, FeatureSet::new(), Some(description));
        if self.corpus.add_crash_entry(&entry) {
            let path = self.store.crash_path(&entry.identity);
            self.store.write(&path, &entry.input)?;
            log::warn!(
                "CRASH in {path:?}!\n{}",
                entry.crash_description.as_deref().unwrap_or_default()
            );
        } else {
            log::warn!("DUPLICATE CRASH");
        }
        if self.crashes >= self.options.max_crashes {
            log::warn!("Maximum of {} crashes reached, aborting", self.options.max_crashes);
        }
        Ok(())
    }

    fn add_new_entry(&mut self, mut entry: CorpusEntry) -> Result<EntryId, FuzzerError> {
        let path = self.store.corpus_path(&entry.identity);
        self.store.write(&path, &entry.input)?;
        entry.storage_path = Some(path);
        Ok(self.corpus.add_entry(entry))
    }

    /// Replaces `base_id` with `entry` if it is shorter and keeps every feature
    /// the base owns. The base's artifact is deleted on success.
    fn try_reduce(&mut self, base_id: EntryId, mut entry: CorpusEntry) -> Result<bool, FuzzerError> {
        let Some(base) = self.corpus.get(base_id) else {
            return Ok(false);
        };
        if entry.len() >= base.len() || !entry.has_all_unique_features_of(base) {
            return Ok(false);
        }
        let old_path = base.storage_path.clone();
        let new_path = self.store.corpus_path(&entry.identity);
        entry.storage_path = Some(new_path.clone());
        let input = entry.input.clone();
        if !self.corpus.replace_entry(base_id, entry) {
            return Ok(false);
        }
        self.store.write(&new_path, &input)?;
        if let Some(old_path) = old_path.filter(|old| *old != new_path) {
            self.store.remove(&old_path)?;
        }
        Ok(true)
    }

    fn run_budget_exhausted(&self) -> bool {
        self.options.max_runs.is_some_and(|max| self.runs >= max)
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if self.stop.load(Ordering::SeqCst) {
            Some(StopReason::Interrupted)
        } else if self.crashes >= self.options.max_crashes {
            Some(StopReason::CrashBudget)
        } else if self.run_budget_exhausted() {
            Some(StopReason::RunBudget)
        } else if self.options.max_time.is_some_and(|max| self.started.elapsed() >= max) {
            Some(StopReason::TimeBudget)
        } else {
            None
        }
    }

    fn log_progress(&self, event: ProgressEvent, len: usize, max_len: usize) {
        let stats = ProgressStats {
            runs: self.runs,
            features: self.corpus.num_features(),
            new_features: self.corpus.num_features().saturating_sub(self.initial_features),
            corpus_len: self.corpus.len(),
            corpus_bytes: self.corpus.total_len(),
            len,
            max_len,
            elapsed: self.started.elapsed(),
        };
        log::info!("{}", format_progress(event, &stats));
    }

    fn summary(&self, stop_reason: StopReason) -> SessionSummary {
        SessionSummary {
            runs: self.runs,
            crashes: self.crashes,
            unique_crashes: self.corpus.num_crashes(),
            corpus_len: self.corpus.len(),
            features: self.corpus.num_features(),
            new_features: self.corpus.num_features().saturating_sub(self.initial_features),
            elapsed: self.started.elapsed(),
            stop_reason,
        }
    }
}

impl Drop for Fuzzer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        // the host failed mid-run; keep the input that was being executed
        if let Err(e) = self.recover_in_flight() {
            log::error!("Failed to store in-flight input after fatal error: {e}");
        }
    }
}
