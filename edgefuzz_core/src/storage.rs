use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Corpus directory {0:?} does not exist")]
    MissingCorpusDir(PathBuf),
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Scratch file in the output directory holding the input under execution.
const IN_FLIGHT_FILE: &str = ".in-flight";

/// Where a fuzzing session reads seeds from and writes artifacts to.
///
/// Corpus entries live in the corpus directory, named by their identity.
/// Crashes (`crash-<identity>`) and minimized reproducers (`minimized-<identity>`)
/// go to the output directory. Artifacts hold the raw input bytes only.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    corpus_dir: PathBuf,
    output_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(corpus_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            corpus_dir: corpus_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Checks that the corpus directory exists and creates the output directory.
    pub fn prepare(&self) -> Result<(), StorageError> {
        if !self.corpus_dir.exists() {
            return Err(StorageError::MissingCorpusDir(self.corpus_dir.clone()));
        }
        if !self.corpus_dir.is_dir() {
            return Err(StorageError::NotADirectory(self.corpus_dir.clone()));
        }
        self.create_output_dir()
    }

    pub fn create_output_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.output_dir).map_err(io_error(&self.output_dir))
    }

    /// Reads every seed file under the corpus directory, recursively.
    ///
    /// Hidden files and directories are skipped. Seeds are returned sorted by
    /// path so loading order does not depend on the filesystem.
    pub fn load_seeds(&self) -> Result<Vec<(PathBuf, Vec<u8>)>, StorageError> {
        self.prepare()?;
        let mut paths = Vec::new();
        collect_files(&self.corpus_dir, &mut paths)?;
        paths.sort();
        paths
            .into_iter()
            .map(|path| {
                let bytes = fs::read(&path).map_err(io_error(&path))?;
                Ok((path, bytes))
            })
            .collect()
    }

    pub fn corpus_path(&self, identity: &str) -> PathBuf {
        self.corpus_dir.join(identity)
    }

    pub fn crash_path(&self, identity: &str) -> PathBuf {
        self.output_dir.join(format!("crash-{identity}"))
    }

    pub fn minimized_path(&self, identity: &str) -> PathBuf {
        self.output_dir.join(format!("minimized-{identity}"))
    }

    /// The input being executed is kept here until the run returns, so it
    /// survives a process that dies without unwinding.
    pub fn in_flight_path(&self) -> PathBuf {
        self.output_dir.join(IN_FLIGHT_FILE)
    }

    /// Reads and removes the in-flight scratch file, if a run left one behind.
    pub fn take_in_flight(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.in_flight_path();
        let input = match fs::read(&path) {
            Ok(input) => input,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        self.remove(&path)?;
        Ok(Some(input))
    }

    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        fs::write(path, bytes).map_err(io_error(path))
    }

    /// Removes an artifact. A file that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StorageError> {
    for dir_entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let path = dir_entry.map_err(io_error(dir))?.path();
        if is_hidden(&path) {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_corpus_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("nope"), dir.path());
        assert!(matches!(store.load_seeds(), Err(StorageError::MissingCorpusDir(_))));
    }

    #[test]
    fn corpus_dir_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        let store = ArtifactStore::new(&file, dir.path());
        assert!(matches!(store.prepare(), Err(StorageError::NotADirectory(_))));
    }

    #[test]
    fn seeds_load_recursively_skipping_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir_all(corpus.join("nested")).unwrap();
        fs::create_dir_all(corpus.join(".git")).unwrap();
        fs::write(corpus.join("b"), b"bee").unwrap();
        fs::write(corpus.join("a"), b"ay").unwrap();
        fs::write(corpus.join("nested").join("c"), b"").unwrap();
        fs::write(corpus.join(".hidden"), b"secret").unwrap();
        fs::write(corpus.join(".git").join("HEAD"), b"ref").unwrap();

        let store = ArtifactStore::new(&corpus, dir.path().join("out"));
        let seeds = store.load_seeds().unwrap();
        let contents: Vec<&[u8]> = seeds.iter().map(|(_, bytes)| bytes.as_slice()).collect();
        assert_eq!(contents, vec![&b"ay"[..], &b"bee"[..], &b""[..]]);
        assert!(dir.path().join("out").is_dir());
    }

    #[test]
    fn artifact_paths_follow_naming_scheme() {
        let store = ArtifactStore::new("/corpus", "/out");
        assert_eq!(store.corpus_path("abc"), PathBuf::from("/corpus/abc"));
        assert_eq!(store.crash_path("abc"), PathBuf::from("/out/crash-abc"));
        assert_eq!(store.minimized_path("abc"), PathBuf::from("/out/minimized-abc"));
    }

    #[test]
    fn write_and_remove_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        let path = store.crash_path("deadbeef");
        store.write(&path, b"\x00bug").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"\x00bug");
        store.remove(&path).unwrap();
        assert!(!path.exists());
        store.remove(&path).unwrap();
    }

    #[test]
    fn in_flight_input_is_taken_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path().join("out"));
        store.create_output_dir().unwrap();
        assert!(store.take_in_flight().unwrap().is_none());

        store.write(&store.in_flight_path(), b"pending").unwrap();
        assert_eq!(store.take_in_flight().unwrap(), Some(b"pending".to_vec()));
        assert!(!store.in_flight_path().exists());
        assert!(store.take_in_flight().unwrap().is_none());
    }
}
