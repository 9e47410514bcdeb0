//! Coverage-guided mutation fuzzing engine.
//!
//! The [`Fuzzer`] mutates inputs from a [`Corpus`], runs them through an
//! [`Executor`], and keeps inputs that reach features (bucketed edge hit
//! counts) no other corpus entry owns, or that shrink an existing entry
//! without losing any of its features.

pub mod config;
pub mod corpus;
pub mod dictionary;
pub mod entry;
pub mod executor;
pub mod feature;
pub mod fuzzer;
pub mod mutator;
pub mod observer;
pub mod report;
pub mod rng;
pub mod scheduler;
pub mod storage;

pub use config::EdgefuzzConfig;
pub use corpus::{Corpus, CrashDedup};
pub use dictionary::{DictionaryError, load_dictionary_file, parse_dictionary};
pub use entry::{CorpusEntry, EntryId};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, ExecutionResult, Executor, ExecutorError, HarnessError,
    InProcessExecutor, InputDelivery,
};
pub use feature::{EdgeCounts, EdgeId, Feature, FeatureSet};
pub use fuzzer::{Fuzzer, FuzzerError, FuzzerOptions, SessionSummary, StopReason};
pub use mutator::{ByteMutator, MutationKind, Mutator};
pub use observer::EdgeTracer;
pub use report::CoverageReport;
pub use rng::FuzzRng;
pub use scheduler::{RandomScheduler, Scheduler, SchedulerKind, UniqueFeatureScheduler};
pub use storage::{ArtifactStore, StorageError};
