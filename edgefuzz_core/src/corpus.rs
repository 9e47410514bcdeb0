use crate::entry::{CorpusEntry, EntryId, input_identity};
use crate::feature::{EdgeId, Feature, edge_of};
use crate::rng::FuzzRng;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Which property of a crashing entry identifies "the same crash".
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CrashDedup {
    /// Crashes with the same description are duplicates, whatever their input.
    #[default]
    Description,
    /// Only byte-identical crashing inputs are duplicates.
    Input,
}

/// The active working set of the fuzzer.
///
/// Every feature ever observed is owned by exactly one active entry; an entry
/// joins the corpus only if it brings at least one feature no other entry owns.
/// A shorter input that still exhibits all of an entry's owned features can
/// take that entry's place through [`Corpus::replace_entry`], which keeps the
/// corpus drifting towards small inputs without ever losing coverage.
///
/// The corpus also keeps the set of crash identities seen so far. Crashing
/// entries are never part of the active set.
#[derive(Debug, Default)]
pub struct Corpus {
    /// Active entries. Order is only meaningful for random selection.
    entries: Vec<CorpusEntry>,
    /// Position of each active entry inside `entries`.
    positions: HashMap<EntryId, usize>,
    /// Owner of every feature seen so far.
    owners: HashMap<Feature, EntryId>,
    /// Identities (input digests) of the active entries, with multiplicity.
    identities: HashMap<String, usize>,
    crash_identities: HashSet<String>,
    crash_dedup: CrashDedup,
    next_id: u64,
    total_len: usize,
}

impl Corpus {
    /// Creates an empty corpus deduplicating crashes by description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty corpus with the given crash dedup policy.
    pub fn with_crash_dedup(crash_dedup: CrashDedup) -> Self {
        Self {
            crash_dedup,
            ..Self::default()
        }
    }

    /// Sets `entry.unique_features` to the features of `entry` that no active
    /// entry owns yet. The corpus itself is left untouched.
    pub fn compute_unique_features(&self, entry: &mut CorpusEntry) {
        entry.unique_features = entry
            .features
            .iter()
            .filter(|feature| !self.owners.contains_key(feature))
            .copied()
            .collect();
    }

    /// Adds `entry` to the active set and makes it the owner of its unique features.
    ///
    /// Features of `entry` that are not owned by anyone are claimed as well, so
    /// the seen-feature map always covers every feature of every active entry.
    ///
    /// # Panics
    /// Panics if `entry.unique_features` is empty: callers must run
    /// [`Corpus::compute_unique_features`] and check the result first.
    pub fn add_entry(&mut self, mut entry: CorpusEntry) -> EntryId {
        assert!(
            !entry.unique_features.is_empty(),
            "Corpus::add_entry requires an entry with unique features"
        );
        let id = self.allocate_id();
        for feature in &entry.features {
            if !self.owners.contains_key(feature) {
                entry.unique_features.insert(*feature);
            }
        }
        for feature in &entry.unique_features {
            self.owners.insert(*feature, id);
        }
        self.insert_active(id, entry);
        id
    }

    /// Replaces the active entry `old_id` with the shorter `new_entry`.
    ///
    /// The swap only happens when `old_id` is still active, `new_entry` is
    /// strictly shorter, its features cover everything `old_id` owns, and no
    /// other active entry holds the same input. On success `new_entry` inherits
    /// the ownership of all of `old_id`'s unique features (plus any feature of
    /// its own nobody owned yet) and `old_id` is evicted.
    ///
    /// # Returns
    /// `true` if the swap took place, `false` if a precondition did not hold.
    pub fn replace_entry(&mut self, old_id: EntryId, mut new_entry: CorpusEntry) -> bool {
        let Some(&old_pos) = self.positions.get(&old_id) else {
            return false;
        };
        let old_entry = &self.entries[old_pos];
        if new_entry.input.len() >= old_entry.input.len()
            || !new_entry.has_all_unique_features_of(old_entry)
            || self.identities.contains_key(&new_entry.identity)
        {
            return false;
        }
        if old_entry
            .unique_features
            .iter()
            .any(|feature| self.owners.get(feature) != Some(&old_id))
        {
            return false;
        }

        let old_entry = self.remove_active(old_id);
        let new_id = self.allocate_id();
        new_entry.unique_features = old_entry.unique_features;
        for feature in &new_entry.features {
            if !self.owners.contains_key(feature) {
                new_entry.unique_features.insert(*feature);
            }
        }
        for feature in &new_entry.unique_features {
            self.owners.insert(*feature, new_id);
        }
        self.insert_active(new_id, new_entry);
        true
    }

    /// Records a crashing entry.
    ///
    /// # Returns
    /// `true` if the crash identity was not seen before (the caller should
    /// persist it), `false` for a duplicate.
    pub fn add_crash_entry(&mut self, entry: &CorpusEntry) -> bool {
        let identity = self.crash_identity(entry);
        self.crash_identities.insert(identity)
    }

    /// The identity a crashing entry is deduplicated on under this corpus's policy.
    pub fn crash_identity(&self, entry: &CorpusEntry) -> String {
        match (self.crash_dedup, &entry.crash_description) {
            (CrashDedup::Description, Some(description)) => {
                input_identity(description.as_bytes())
            }
            _ => entry.identity.clone(),
        }
    }

    /// Returns a uniformly chosen active entry, or `None` for an empty corpus.
    pub fn random_entry(&self, rng: &mut FuzzRng) -> Option<&CorpusEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.entries.get(rng.below(self.entries.len()))
    }

    pub fn get(&self, id: EntryId) -> Option<&CorpusEntry> {
        self.positions.get(&id).map(|&pos| &self.entries[pos])
    }

    /// Whether an active entry holds exactly this input.
    pub fn contains_identity(&self, identity: &str) -> bool {
        self.identities.contains_key(identity)
    }

    /// Current owner of `feature`, if it was ever seen.
    pub fn owner_of(&self, feature: Feature) -> Option<EntryId> {
        self.owners.get(&feature).copied()
    }

    /// Active entries in selection order.
    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of owned (seen) features.
    pub fn num_features(&self) -> usize {
        self.owners.len()
    }

    /// Sum of the input lengths of all active entries.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Length of the longest active input, `0` for an empty corpus.
    pub fn max_len(&self) -> usize {
        self.entries.iter().map(CorpusEntry::len).max().unwrap_or(0)
    }

    /// Every feature seen this session, in ascending order.
    pub fn seen_features(&self) -> BTreeSet<Feature> {
        self.owners.keys().copied().collect()
    }

    /// Every edge covered by at least one seen feature, in ascending order.
    pub fn covered_edges(&self) -> BTreeSet<EdgeId> {
        self.owners.keys().map(|feature| edge_of(*feature)).collect()
    }

    /// Number of distinct crash identities recorded.
    pub fn num_crashes(&self) -> usize {
        self.crash_identities.len()
    }

    fn allocate_id(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert_active(&mut self, id: EntryId, mut entry: CorpusEntry) {
        entry.id = Some(id);
        self.total_len += entry.input.len();
        *self.identities.entry(entry.identity.clone()).or_default() += 1;
        self.positions.insert(id, self.entries.len());
        self.entries.push(entry);
    }

    fn remove_active(&mut self, id: EntryId) -> CorpusEntry {
        let pos = self.positions[&id];
        let removed = self.entries.swap_remove(pos);
        self.positions.remove(&id);
        if let Some(moved) = self.entries.get(pos).and_then(|entry| entry.id) {
            self.positions.insert(moved, pos);
        }
        self.total_len -= removed.input.len();
        if let Some(count) = self.identities.get_mut(&removed.identity) {
            *count -= 1;
            if *count == 0 {
                self.identities.remove(&removed.identity);
            }
        }
        removed
    }
}
