use crate::feature::FeatureSet;
use std::path::PathBuf;

/// Identifier assigned to an entry when it joins the active corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

/// Content digest of an input: the lowercase hex MD5 of its bytes.
pub fn input_identity(input: &[u8]) -> String {
    format!("{:x}", md5::compute(input))
}

/// One executed input together with everything learned from running it.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    /// Assigned by the corpus on insertion; `None` while the entry is only a candidate.
    pub id: Option<EntryId>,
    pub input: Vec<u8>,
    /// Digest of `input`, used for artifact names and crash dedup.
    pub identity: String,
    /// Every feature observed when `input` was last executed.
    pub features: FeatureSet,
    /// The subset of `features` this entry owns in the corpus.
    pub unique_features: FeatureSet,
    /// Present only for crashing inputs.
    pub crash_description: Option<String>,
    pub storage_path: Option<PathBuf>,
}

impl CorpusEntry {
    pub fn new(input: Vec<u8>, features: FeatureSet, crash_description: Option<String>) -> Self {
        let identity = input_identity(&input);
        Self {
            id: None,
            input,
            identity,
            features,
            unique_features: FeatureSet::new(),
            crash_description,
            storage_path: None,
        }
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Whether this entry's features cover every feature `other` owns.
    pub fn has_all_unique_features_of(&self, other: &CorpusEntry) -> bool {
        other.unique_features.is_subset(&self.features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_md5_hex() {
        assert_eq!(input_identity(b""), "d41d8cd98f00b204e9800998ecf8427e");
        let a = CorpusEntry::new(b"abc".to_vec(), FeatureSet::new(), None);
        let b = CorpusEntry::new(b"abc".to_vec(), FeatureSet::new(), None);
        assert_eq!(a.identity, b.identity);
        assert_eq!(a.identity, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn unique_feature_coverage_check() {
        let mut owner = CorpusEntry::new(b"long input".to_vec(), [1, 2, 3].into(), None);
        owner.unique_features = [2, 3].into();

        let covering = CorpusEntry::new(b"short".to_vec(), [2, 3, 9].into(), None);
        let partial = CorpusEntry::new(b"short".to_vec(), [1, 2].into(), None);
        assert!(covering.has_all_unique_features_of(&owner));
        assert!(!partial.has_all_unique_features_of(&owner));
    }

    #[test]
    fn crash_entries_keep_their_description() {
        let crash = CorpusEntry::new(vec![0xff], FeatureSet::new(), Some("boom".into()));
        assert_eq!(crash.crash_description.as_deref(), Some("boom"));
        assert_eq!(crash.len(), 1);
        assert!(CorpusEntry::new(vec![], FeatureSet::new(), None).crash_description.is_none());
    }
}
