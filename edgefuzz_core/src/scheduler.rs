use crate::corpus::Corpus;
use crate::entry::EntryId;
use crate::rng::FuzzRng;
use serde::Deserialize;

/// Selection strategies that can be named in the configuration.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    #[default]
    Uniform,
    UniqueWeighted,
}

impl SchedulerKind {
    /// Builds the scheduler this kind names.
    pub fn build(self) -> Box<dyn Scheduler> {
        match self {
            SchedulerKind::Uniform => Box::new(RandomScheduler::new()),
            SchedulerKind::UniqueWeighted => Box::new(UniqueFeatureScheduler::new()),
        }
    }
}

/// A `Scheduler` picks the corpus entries the fuzzer mutates next.
///
/// The fuzzer asks it twice per iteration: once for the base entry and once,
/// independently, for the crossover partner.
pub trait Scheduler: Send + Sync {
    /// Returns a short, static name for log lines.
    fn name(&self) -> &'static str;

    /// Selects the ID of an active entry.
    ///
    /// # Arguments
    /// * `corpus`: The corpus to select from.
    /// * `rng`: The session's random source; schedulers must not keep their own.
    ///
    /// # Returns
    /// `None` if the corpus is empty.
    fn next(&mut self, corpus: &Corpus, rng: &mut FuzzRng) -> Option<EntryId>;
}

/// Selects entries uniformly at random.
#[derive(Default, Debug)]
pub struct RandomScheduler;

impl RandomScheduler {
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl Scheduler for RandomScheduler {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn next(&mut self, corpus: &Corpus, rng: &mut FuzzRng) -> Option<EntryId> {
        corpus.random_entry(rng).and_then(|entry| entry.id)
    }
}

/// Selects entries with probability proportional to the number of features
/// they own, so inputs guarding many rare behaviors are mutated more often.
#[derive(Default, Debug)]
pub struct UniqueFeatureScheduler;

impl UniqueFeatureScheduler {
    pub fn new() -> Self {
        UniqueFeatureScheduler
    }
}

impl Scheduler for UniqueFeatureScheduler {
    fn name(&self) -> &'static str {
        "unique-weighted"
    }

    fn next(&mut self, corpus: &Corpus, rng: &mut FuzzRng) -> Option<EntryId> {
        let entries = corpus.entries();
        let total: usize = entries.iter().map(|e| e.unique_features.len()).sum();
        if total == 0 {
            return corpus.random_entry(rng).and_then(|entry| entry.id);
        }
        let mut pick = rng.below(total);
        for entry in entries {
            let weight = entry.unique_features.len();
            if pick < weight {
                return entry.id;
            }
            pick -= weight;
        }
        None
    }
}
