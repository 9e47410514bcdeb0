use crate::feature::{EdgeCounts, EdgeId};
use crate::observer::{EdgeTracer, edges_from_locations, parse_instrumented_edges};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Environment variable telling an instrumented target where to write its trace.
pub const TRACE_FILE_ENV: &str = "EDGEFUZZ_TRACE_FILE";

/// Failure category assigned to harness panics.
pub const PANIC_CATEGORY: &str = "panic";

/// Number of trailing stderr lines kept in a crash description.
const STDERR_TAIL_LINES: usize = 10;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of running the target once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Normal completion (or an allow-listed failure) with the observed edge counts.
    Ok(EdgeCounts),
    /// The target failed or timed out.
    Crashed(String),
}

impl ExecutionResult {
    pub fn is_crash(&self) -> bool {
        matches!(self, ExecutionResult::Crashed(_))
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The harness or instrumentation layer failed; no verdict about the target is possible.
    #[error("Harness is broken: {0}")]
    HarnessBroken(String),
    #[error("Executor I/O error: {0}")]
    Io(String),
}

/// Error an in-process harness reports instead of returning normally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    /// The target's own logic failed. `category` is matched against the allow-list.
    #[error("{category}: {message}")]
    Target { category: String, message: String },
    /// The harness itself could not run the input.
    #[error("{0}")]
    Broken(String),
}

impl HarnessError {
    pub fn target(category: impl Into<String>, message: impl Into<String>) -> Self {
        HarnessError::Target {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// An `Executor` runs the target on one input and reports what happened.
pub trait Executor {
    /// Runs `input` through the target, enforcing `timeout` as a wall-clock limit.
    ///
    /// A hung target is reported as [`ExecutionResult::Crashed`]. An `Err` means
    /// the harness is unusable and the session must stop.
    fn execute(&mut self, input: &[u8], timeout: Duration) -> Result<ExecutionResult, ExecutorError>;

    /// All edges the target was instrumented with, when the executor knows them.
    fn instrumented_edges(&self) -> Option<BTreeSet<EdgeId>> {
        None
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

enum HarnessOutcome {
    Returned(Result<(), HarnessError>),
    Panicked(String),
}

/// Runs a Rust closure as the target.
///
/// Each run happens on a fresh worker thread so a panic or a hang cannot take
/// down the fuzzer. A run that exceeds its timeout is reported as a crash and
/// its thread is left detached.
pub struct InProcessExecutor<F> {
    harness: Arc<F>,
    allowed_failures: HashSet<String>,
    instrumented_edges: Option<BTreeSet<EdgeId>>,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&[u8], &mut EdgeTracer) -> Result<(), HarnessError> + Send + Sync + 'static,
{
    pub fn new(harness: F) -> Self {
        Self {
            harness: Arc::new(harness),
            allowed_failures: HashSet::new(),
            instrumented_edges: None,
        }
    }

    /// Failure categories that count as normal completion rather than crashes.
    pub fn with_allowed_failures<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_failures = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_instrumented_edges(mut self, edges: BTreeSet<EdgeId>) -> Self {
        self.instrumented_edges = Some(edges);
        self
    }

    fn classify(&self, outcome: HarnessOutcome, edges: EdgeCounts) -> Result<ExecutionResult, ExecutorError> {
        let (category, description) = match outcome {
            HarnessOutcome::Returned(Ok(())) => return Ok(ExecutionResult::Ok(edges)),
            HarnessOutcome::Returned(Err(HarnessError::Broken(msg))) => {
                return Err(ExecutorError::HarnessBroken(msg));
            }
            HarnessOutcome::Returned(Err(HarnessError::Target { category, message })) => {
                let description = format!("{category}: {message}");
                (category, description)
            }
            HarnessOutcome::Panicked(msg) => (PANIC_CATEGORY.to_string(), format!("{PANIC_CATEGORY}: {msg}")),
        };
        if self.allowed_failures.contains(&category) {
            Ok(ExecutionResult::Ok(edges))
        } else {
            Ok(ExecutionResult::Crashed(description))
        }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&[u8], &mut EdgeTracer) -> Result<(), HarnessError> + Send + Sync + 'static,
{
    fn execute(&mut self, input: &[u8], timeout: Duration) -> Result<ExecutionResult, ExecutorError> {
        let harness = Arc::clone(&self.harness);
        let input = input.to_vec();
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("edgefuzz-harness".to_string())
            .spawn(move || {
                let mut tracer = EdgeTracer::new();
                let outcome = match catch_unwind(AssertUnwindSafe(|| harness(&input, &mut tracer))) {
                    Ok(result) => HarnessOutcome::Returned(result),
                    Err(payload) => HarnessOutcome::Panicked(panic_message(payload.as_ref())),
                };
                // the receiver is gone if the run already timed out
                let _ = tx.send((outcome, tracer.into_edges()));
            })
            .map_err(|e| ExecutorError::Io(format!("Failed to spawn harness thread: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok((outcome, edges)) => self.classify(outcome, edges),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(ExecutionResult::Crashed(format!(
                "timeout: no result after {}ms",
                timeout.as_millis()
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ExecutorError::HarnessBroken(
                "harness thread exited without reporting a result".to_string(),
            )),
        }
    }

    fn instrumented_edges(&self) -> Option<BTreeSet<EdgeId>> {
        self.instrumented_edges.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputDelivery {
    #[default]
    StdIn,
    /// Input is written to a file; `{}` in the template is replaced by its path.
    File(String),
}

#[derive(Debug, Clone, Default)]
pub struct CommandExecutorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub working_dir: Option<PathBuf>,
    /// Exit code the harness uses to signal its own failure.
    pub harness_error_exit_code: Option<i32>,
    /// Failure categories (`exit:<code>`, `signal:<n>`) that are not crashes.
    pub allowed_failures: HashSet<String>,
    /// Lists every edge the target was instrumented with, one `<from>\t<to>`
    /// location pair per line.
    pub instrumented_edges_file: Option<PathBuf>,
}

/// Runs an external command as the target.
///
/// The child finds the path of its trace file in `EDGEFUZZ_TRACE_FILE`. Each
/// line it writes there is one visited location; consecutive locations form
/// edges. A target that writes nothing simply reports no coverage.
///
/// Every run gets fresh trace and input file names, so a straggling process
/// from a timed-out run cannot write into a later run's trace.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
    scratch: tempfile::TempDir,
    instrumented_edges: Option<BTreeSet<EdgeId>>,
    run: u64,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Result<Self, ExecutorError> {
        if config.command.is_empty() {
            return Err(ExecutorError::HarnessBroken("empty target command".to_string()));
        }
        let scratch = tempfile::Builder::new()
            .prefix("edgefuzz-")
            .tempdir()
            .map_err(|e| ExecutorError::Io(format!("Failed to create scratch directory: {e}")))?;
        let instrumented_edges = match &config.instrumented_edges_file {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    ExecutorError::Io(format!("Failed to read instrumented edges file {path:?}: {e}"))
                })?;
                Some(parse_instrumented_edges(&text))
            }
            None => None,
        };
        Ok(Self {
            config,
            scratch,
            instrumented_edges,
            run: 0,
        })
    }

    fn trace_path(&self) -> PathBuf {
        self.scratch.path().join(format!("trace-{}", self.run))
    }

    fn input_path(&self) -> PathBuf {
        self.scratch.path().join(format!("input-{}", self.run))
    }

    fn remove_run_files(&self) -> Result<(), ExecutorError> {
        for path in [self.trace_path(), self.input_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ExecutorError::Io(format!("Failed to remove {path:?}: {e}"))),
            }
        }
        Ok(())
    }

    fn build_command(&self, input: &[u8]) -> Result<Command, ExecutorError> {
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.env(TRACE_FILE_ENV, self.trace_path());

        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(template) => {
                let input_path = self.input_path();
                fs::write(&input_path, input).map_err(|e| {
                    ExecutorError::Io(format!("Failed to write input file {input_path:?}: {e}"))
                })?;
                let path_str = input_path
                    .to_str()
                    .ok_or_else(|| ExecutorError::Io("Input file path is not valid UTF-8".to_string()))?;
                for part in template.replace("{}", path_str).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
            }
        }
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        Ok(cmd)
    }

    /// Polls the child until it exits or `timeout` elapses; `None` means it was killed.
    fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>, ExecutorError> {
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) if start_time.elapsed() > timeout => {
                    log::debug!("target timed out after {:?}, killing", start_time.elapsed());
                    child
                        .kill()
                        .map_err(|e| ExecutorError::Io(format!("Failed to kill timed-out process: {e}")))?;
                    let _ = child.wait();
                    return Ok(None);
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(ExecutorError::Io(format!("Error waiting for child: {e}"))),
            }
        }
    }

    fn read_trace(&self) -> Result<EdgeCounts, ExecutorError> {
        match fs::read(self.trace_path()) {
            Ok(raw) => {
                let text = String::from_utf8_lossy(&raw);
                Ok(edges_from_locations(
                    text.lines().map(str::trim).filter(|line| !line.is_empty()),
                ))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(EdgeCounts::new()),
            Err(e) => Err(ExecutorError::HarnessBroken(format!("Unreadable trace file: {e}"))),
        }
    }

    fn run_target(&self, input: &[u8], timeout: Duration) -> Result<ExecutionResult, ExecutorError> {
        let mut cmd = self.build_command(input)?;
        let mut child = cmd.spawn().map_err(|e| {
            ExecutorError::HarnessBroken(format!("Failed to spawn command {:?}: {e}", self.config.command))
        })?;

        // the timeout clock must start even if the target never reads stdin
        let stdin_writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_vec();
            thread::spawn(move || match stdin.write_all(&input) {
                // a target that exits without reading its input is not an error
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            })
        });

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let Some(status) = Self::wait_with_timeout(&mut child, timeout)? else {
            // a grandchild may still hold the pipes open; leave both threads detached
            return Ok(ExecutionResult::Crashed(format!(
                "timeout: no result after {}ms",
                timeout.as_millis()
            )));
        };
        if let Some(writer) = stdin_writer.filter(|writer| writer.is_finished()) {
            if let Ok(Err(e)) = writer.join() {
                return Err(ExecutorError::Io(format!("Failed to write to stdin: {e}")));
            }
        }
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if status.success() {
            return Ok(ExecutionResult::Ok(self.read_trace()?));
        }
        if status.code().is_some() && status.code() == self.config.harness_error_exit_code {
            return Err(ExecutorError::HarnessBroken(format!(
                "harness exited with {status}: {}",
                stderr_tail(&stderr)
            )));
        }

        let category = failure_category(&status);
        if self.config.allowed_failures.contains(&category) {
            return Ok(ExecutionResult::Ok(self.read_trace()?));
        }
        let tail = stderr_tail(&stderr);
        if tail.is_empty() {
            Ok(ExecutionResult::Crashed(category))
        } else {
            Ok(ExecutionResult::Crashed(format!("{category}\n{tail}")))
        }
    }
}

fn failure_category(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit:{code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal:{signal}");
        }
    }
    "abnormal".to_string()
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n")
}

impl Executor for CommandExecutor {
    fn execute(&mut self, input: &[u8], timeout: Duration) -> Result<ExecutionResult, ExecutorError> {
        self.run += 1;
        let result = self.run_target(input, timeout);
        self.remove_run_files()?;
        result
    }

    fn instrumented_edges(&self) -> Option<BTreeSet<EdgeId>> {
        self.instrumented_edges.clone()
    }
}


#[cfg(all(test, unix))]
mod command_executor_tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn executor_for(script: String, delivery: InputDelivery) -> CommandExecutor {
        CommandExecutor::new(CommandExecutorConfig {
            command: vec![script],
            input_delivery: delivery,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn cmd_exec_successful_run_collects_trace() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "ok.sh",
            r#"cat > /dev/null
printf 'a.c:1\na.c:2\n' > "$EDGEFUZZ_TRACE_FILE""#,
        );
        let mut executor = executor_for(script, InputDelivery::StdIn);
        match executor.execute(b"hello", TIMEOUT).unwrap() {
            ExecutionResult::Ok(edges) => assert_eq!(edges.len(), 2),
            other => panic!("Expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_without_trace_reports_no_edges() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "quiet.sh", "exit 0");
        let mut executor = executor_for(script, InputDelivery::StdIn);
        assert_eq!(
            executor.execute(b"ignored", TIMEOUT).unwrap(),
            ExecutionResult::Ok(EdgeCounts::new())
        );
    }

    #[test]
    fn cmd_exec_crash_includes_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "crash.sh", "echo 'assertion failed' >&2\nexit 3");
        let mut executor = executor_for(script, InputDelivery::StdIn);
        match executor.execute(b"", TIMEOUT).unwrap() {
            ExecutionResult::Crashed(desc) => {
                assert!(desc.starts_with("exit:3"), "{desc}");
                assert!(desc.contains("assertion failed"), "{desc}");
            }
            other => panic!("Expected Crash, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_signal_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "segv.sh", "kill -SEGV $$");
        let mut executor = executor_for(script, InputDelivery::StdIn);
        assert_eq!(
            executor.execute(b"", TIMEOUT).unwrap(),
            ExecutionResult::Crashed("signal:11".to_string())
        );
    }

    #[test]
    fn cmd_exec_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "hang.sh", "exec sleep 5");
        let mut executor = executor_for(script, InputDelivery::StdIn);
        match executor.execute(b"", Duration::from_millis(100)).unwrap() {
            ExecutionResult::Crashed(desc) => assert!(desc.starts_with("timeout"), "{desc}"),
            other => panic!("Expected timeout crash, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_timeout_when_target_ignores_large_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "deaf.sh", "exec sleep 3");
        let mut executor = executor_for(script, InputDelivery::StdIn);
        let input = vec![b'x'; 1 << 20];
        let start = Instant::now();
        match executor.execute(&input, Duration::from_millis(100)).unwrap() {
            ExecutionResult::Crashed(desc) => assert!(desc.starts_with("timeout"), "{desc}"),
            other => panic!("Expected timeout crash, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    }

    #[test]
    fn cmd_exec_large_stdin_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "count.sh", r#"[ "$(wc -c | tr -d " ")" -eq 1048576 ] || exit 4"#);
        let mut executor = executor_for(script, InputDelivery::StdIn);
        let input = vec![b'x'; 1 << 20];
        assert_eq!(
            executor.execute(&input, TIMEOUT).unwrap(),
            ExecutionResult::Ok(EdgeCounts::new())
        );
    }

    #[test]
    fn cmd_exec_straggler_cannot_write_into_next_trace() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "straggler.sh",
            r#"input=$(cat)
if [ "$input" = hang ]; then
  (sleep 0.3; echo late.c:1 >> "$EDGEFUZZ_TRACE_FILE") &
  exec sleep 5
fi
sleep 0.8"#,
        );
        let mut executor = executor_for(script, InputDelivery::StdIn);
        assert!(executor.execute(b"hang", Duration::from_millis(100)).unwrap().is_crash());
        assert_eq!(
            executor.execute(b"ok", TIMEOUT).unwrap(),
            ExecutionResult::Ok(EdgeCounts::new())
        );
    }

    #[test]
    fn cmd_exec_reports_instrumented_edges() {
        let dir = tempfile::tempdir().unwrap();
        let edges_file = dir.path().join("edges.txt");
        fs::write(&edges_file, "t.c:1\nt.c:1\tt.c:2\nt.c:2\tt.c:3\n").unwrap();
        let script = write_script(&dir, "traced.sh", r#"printf 't.c:1\nt.c:2\n' > "$EDGEFUZZ_TRACE_FILE""#);
        let mut executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec![script],
            instrumented_edges_file: Some(edges_file),
            ..Default::default()
        })
        .unwrap();

        let instrumented = executor.instrumented_edges().unwrap();
        assert_eq!(instrumented.len(), 3);
        let ExecutionResult::Ok(edges) = executor.execute(b"", TIMEOUT).unwrap() else {
            panic!("Expected Ok");
        };
        assert_eq!(edges.len(), 2);
        assert!(edges.keys().all(|edge| instrumented.contains(edge)));
    }

    #[test]
    fn missing_instrumented_edges_file_is_rejected() {
        let err = CommandExecutor::new(CommandExecutorConfig {
            command: vec!["/bin/true".to_string()],
            instrumented_edges_file: Some(PathBuf::from("/no/such/edges.txt")),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, ExecutorError::Io(msg) if msg.contains("instrumented edges")));
    }

    #[test]
    fn cmd_exec_input_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "file.sh", r#"if grep -q CRASH "$1"; then exit 1; fi"#);
        let mut executor = executor_for(script, InputDelivery::File("{}".to_string()));
        assert!(!executor.execute(b"OK_FILE", TIMEOUT).unwrap().is_crash());
        assert_eq!(
            executor.execute(b"CRASHFILE", TIMEOUT).unwrap(),
            ExecutionResult::Crashed("exit:1".to_string())
        );
    }

    #[test]
    fn cmd_exec_allowed_failure_folds_into_ok() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "expected.sh", "exit 2");
        let mut executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec![script],
            allowed_failures: HashSet::from(["exit:2".to_string()]),
            ..Default::default()
        })
        .unwrap();
        assert!(!executor.execute(b"", TIMEOUT).unwrap().is_crash());
    }

    #[test]
    fn cmd_exec_harness_error_exit_code_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "broken.sh", "echo 'parse error' >&2\nexit 99");
        let mut executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec![script],
            harness_error_exit_code: Some(99),
            ..Default::default()
        })
        .unwrap();
        let err = executor.execute(b"", TIMEOUT).unwrap_err();
        assert!(matches!(err, ExecutorError::HarnessBroken(msg) if msg.contains("parse error")));
    }

    #[test]
    fn cmd_exec_invalid_command() {
        let mut executor = executor_for(
            "./this_command_does_not_exist_ever_12345.sh".to_string(),
            InputDelivery::StdIn,
        );
        let err = executor.execute(b"", TIMEOUT).unwrap_err();
        assert!(matches!(err, ExecutorError::HarnessBroken(msg) if msg.contains("Failed to spawn command")));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandExecutor::new(CommandExecutorConfig::default()).is_err());
    }
}
