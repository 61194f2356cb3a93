//! External ordinal-regression collaborator.
//!
//! The mixed-effects fit itself lives outside this crate. A backend takes an
//! annotation table plus a mode string and reports which system pairs differ
//! significantly, optionally with p-values.
//!
//! Report format, one line per compared pair:
//!
//! ```text
//! SystemA - SystemB<TAB><direction>[<TAB><p-value>]
//! ```
//!
//! `-` means `SystemB` is better, `o` means no significant difference, any
//! other direction means `SystemA` is better.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::annotations::AnnotationTable;
use crate::config::RegressionConfig;
use crate::design::RegressionMode;
use crate::error::RegressionError;

/// Ordered system pair `(better, worse)` or `(left, right)` for p-values.
pub type SystemPair = (String, String);

/// Parsed regression report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegressionOutcome {
    /// Significant differences, oriented `(better, worse)`.
    pub detected: BTreeSet<SystemPair>,
    /// P-value of every compared pair, oriented like `detected`.
    pub p_values: BTreeMap<SystemPair, f64>,
}

impl RegressionOutcome {
    pub fn is_empty(&self) -> bool {
        self.detected.is_empty() && self.p_values.is_empty()
    }

    /// P-value for an unordered pair, checking both orientations.
    pub fn p_value_for(&self, a: &str, b: &str) -> Option<f64> {
        self.p_values
            .get(&(a.to_string(), b.to_string()))
            .or_else(|| self.p_values.get(&(b.to_string(), a.to_string())))
            .copied()
    }

    /// Every detected difference with its orientation flipped.
    pub fn reversed(&self) -> BTreeSet<SystemPair> {
        self.detected
            .iter()
            .map(|(a, b)| (b.clone(), a.clone()))
            .collect()
    }
}

/// Parse the textual report of a regression run.
pub fn parse_regression_report(stdout: &str) -> Result<RegressionOutcome, RegressionError> {
    let mut outcome = RegressionOutcome::default();

    for (idx, line) in stdout.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let malformed = || RegressionError::Report {
            line: idx + 1,
            content: line.to_string(),
        };

        let mut fields = line.split('\t');
        let pair = fields.next().ok_or_else(malformed)?;
        let direction = fields.next().ok_or_else(malformed)?.trim();
        let p_value = match fields.next() {
            Some(raw) => Some(raw.trim().parse::<f64>().map_err(|_| malformed())?),
            None => None,
        };
        if fields.next().is_some() {
            return Err(malformed());
        }

        let (a, b) = pair.split_once(" - ").ok_or_else(malformed)?;
        let (mut a, mut b) = (a.trim().to_string(), b.trim().to_string());
        if direction == "-" {
            std::mem::swap(&mut a, &mut b);
        }
        if direction != "o" {
            outcome.detected.insert((a.clone(), b.clone()));
        }
        if let Some(p) = p_value {
            outcome.p_values.insert((a, b), p);
        }
    }

    Ok(outcome)
}

/// A regression collaborator.
#[async_trait]
pub trait RegressionBackend: Send + Sync {
    async fn run_regression(
        &self,
        table: &AnnotationTable,
        mode: &RegressionMode,
    ) -> Result<RegressionOutcome, RegressionError>;
}

/// Runs the regression as a subprocess: `<program> <script> <csv> <score> <mode>`.
///
/// The input table is written to a temporary file that is removed when the
/// call returns, whatever the outcome.
#[derive(Debug, Clone)]
pub struct ScriptRegression {
    program: PathBuf,
    script: PathBuf,
    score_column: String,
    timeout: Option<Duration>,
}

impl ScriptRegression {
    pub fn new(program: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            score_column: "score".to_string(),
            timeout: None,
        }
    }

    pub fn from_config(config: &RegressionConfig) -> Self {
        let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));
        Self {
            program: config.program.clone(),
            script: config.script.clone(),
            score_column: config.score_column.clone(),
            timeout,
        }
    }

    pub fn with_score_column(mut self, column: impl Into<String>) -> Self {
        self.score_column = column.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn invoke(&self, input: &std::path::Path, mode: &str) -> Result<String, RegressionError> {
        let output = Command::new(&self.program)
            .arg(&self.script)
            .arg(input)
            .arg(&self.score_column)
            .arg(mode)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RegressionError::Spawn {
                program: self.program.display().to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(RegressionError::ExitStatus {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl RegressionBackend for ScriptRegression {
    async fn run_regression(
        &self,
        table: &AnnotationTable,
        mode: &RegressionMode,
    ) -> Result<RegressionOutcome, RegressionError> {
        let mut input = tempfile::Builder::new()
            .prefix("annopower-")
            .suffix(".csv")
            .tempfile()?;
        input.write_all(table.to_csv(&self.score_column).as_bytes())?;
        input.flush()?;

        let mode = mode.to_string();
        debug!(
            path = %input.path().display(),
            rows = table.len(),
            mode = %mode,
            "Running regression"
        );

        let stdout = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.invoke(input.path(), &mode))
                .await
                .map_err(|_| RegressionError::Timeout { timeout })??,
            None => self.invoke(input.path(), &mode).await?,
        };

        parse_regression_report(&stdout)
    }
}

/// Backend that replays queued reports, for tests and dry runs.
///
/// Each call pops the next queued result; once the queue is empty every call
/// returns the fallback (no differences by default).
pub struct ScriptedRegression {
    queue: Mutex<Vec<Result<RegressionOutcome, String>>>,
    fallback: RegressionOutcome,
    calls: Mutex<Vec<(usize, String)>>,
}

impl ScriptedRegression {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            fallback: RegressionOutcome::default(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with the parsed `report`.
    pub fn with_report(report: &str) -> Result<Self, RegressionError> {
        let mut backend = Self::new();
        backend.fallback = parse_regression_report(report)?;
        Ok(backend)
    }

    /// Queue a report for the next call.
    pub fn queue_report(&self, report: &str) -> Result<(), RegressionError> {
        let outcome = parse_regression_report(report)?;
        self.lock_queue().push(Ok(outcome));
        Ok(())
    }

    /// Queue a process failure for the next call.
    pub fn queue_failure(&self, stderr: impl Into<String>) {
        self.lock_queue().push(Err(stderr.into()));
    }

    /// `(row count, mode)` of every call so far.
    pub fn calls(&self) -> Vec<(usize, String)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Vec<Result<RegressionOutcome, String>>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ScriptedRegression {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegressionBackend for ScriptedRegression {
    async fn run_regression(
        &self,
        table: &AnnotationTable,
        mode: &RegressionMode,
    ) -> Result<RegressionOutcome, RegressionError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((table.len(), mode.to_string()));

        let next = {
            let mut queue = self.lock_queue();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        };
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(stderr)) => Err(RegressionError::ExitStatus {
                status: "exit status: 1".to_string(),
                stderr,
            }),
            None => Ok(self.fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::{DesignMode, create_design};
    use crate::ordinal::ModelCatalog;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn pair(a: &str, b: &str) -> SystemPair {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_parse_directions() {
        let report = "BART - onmt_pg\t+\t0.001\n__REFERENCE__ - BART\t-\t0.02\nabssentrw - onmt_pg\to\t0.4\n";
        let outcome = parse_regression_report(report).unwrap();

        let expected: BTreeSet<_> = [pair("BART", "onmt_pg"), pair("BART", "__REFERENCE__")]
            .into_iter()
            .collect();
        assert_eq!(outcome.detected, expected);
        assert_eq!(outcome.p_values[&pair("BART", "__REFERENCE__")], 0.02);
        assert_eq!(outcome.p_values[&pair("abssentrw", "onmt_pg")], 0.4);
        assert_eq!(outcome.p_value_for("__REFERENCE__", "BART"), Some(0.02));
    }

    #[test]
    fn test_parse_two_field_lines() {
        let outcome = parse_regression_report("A - B\t+\n\nC - D\to\n").unwrap();
        assert_eq!(outcome.detected.len(), 1);
        assert!(outcome.p_values.is_empty());
    }

    #[test]
    fn test_parse_empty_report() {
        let outcome = parse_regression_report("").unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let err = parse_regression_report("A - B\t+\t0.1\nnonsense\n").unwrap_err();
        assert!(matches!(err, RegressionError::Report { line: 2, .. }));
        assert!(parse_regression_report("A - B\t+\tlow\n").is_err());
        assert!(parse_regression_report("A vs B\t+\n").is_err());
    }

    #[test]
    fn test_reversed() {
        let outcome = parse_regression_report("A - B\t+\n").unwrap();
        assert!(outcome.reversed().contains(&pair("B", "A")));
    }

    fn small_table() -> AnnotationTable {
        let model = ModelCatalog::builtin()
            .get("likertD:multi_news")
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        model.sample(&create_design(2, 2, 1), &mut rng)
    }

    #[tokio::test]
    async fn test_scripted_backend_replays_queue() {
        let backend = ScriptedRegression::new();
        backend.queue_report("A - B\t+\t0.01\n").unwrap();
        backend.queue_failure("fit did not converge");

        let table = small_table();
        let mode = RegressionMode::new(DesignMode::Nested).with_extra("none");

        let first = backend.run_regression(&table, &mode).await.unwrap();
        assert_eq!(first.detected.len(), 1);
        let second = backend.run_regression(&table, &mode).await;
        assert!(matches!(second, Err(RegressionError::ExitStatus { .. })));
        let third = backend.run_regression(&table, &mode).await.unwrap();
        assert!(third.is_empty());

        let calls = backend.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], (table.len(), "nested:none".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_backend_passes_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fit.sh");
        // Echo the mode back and prove the input file exists with a header.
        std::fs::write(
            &script,
            "head -n 1 \"$1\" | grep -q '^system,annotator,document,group,coherence$' || exit 3\n\
             printf 'A - B\\t+\\t0.03\\n%s - x\\to\\t0.5\\n' \"$3\"\n",
        )
        .unwrap();

        let backend = ScriptRegression::new("sh", &script).with_score_column("coherence");
        let table = small_table();
        let groups = crate::grouping::get_annotator_groups(&table);
        let table = table.with_groups(&groups);
        let mode = RegressionMode::new(DesignMode::Crossed).with_extra("none");

        let outcome = backend.run_regression(&table, &mode).await.unwrap();
        assert!(outcome.detected.contains(&pair("A", "B")));
        assert_eq!(outcome.p_value_for("crossed:none", "x"), Some(0.5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_backend_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "echo 'model failed' >&2\nexit 2\n").unwrap();

        let backend = ScriptRegression::new("sh", &script);
        let mode = RegressionMode::new(DesignMode::Nested);
        let err = backend
            .run_regression(&small_table(), &mode)
            .await
            .unwrap_err();
        match err {
            RegressionError::ExitStatus { stderr, .. } => assert_eq!(stderr, "model failed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_backend_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        std::fs::write(&script, "sleep 5\n").unwrap();

        let backend = ScriptRegression::new("sh", &script).with_timeout(Duration::from_millis(100));
        let mode = RegressionMode::new(DesignMode::Nested);
        let err = backend
            .run_regression(&small_table(), &mode)
            .await
            .unwrap_err();
        assert!(matches!(err, RegressionError::Timeout { .. }));
        assert!(err.to_string().ends_with("after 100ms"), "{err}");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let backend = ScriptRegression::new("/nonexistent/annopower-rscript", "fit.r");
        let mode = RegressionMode::new(DesignMode::Crossed);
        let err = backend
            .run_regression(&small_table(), &mode)
            .await
            .unwrap_err();
        assert!(matches!(err, RegressionError::Spawn { .. }));
    }
}
