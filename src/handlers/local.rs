use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutablesConfig, ProcessingConfig};
use crate::error::{MqiError, Result};
use crate::handlers::command::{CommandError, CommandExecutor, CommandSpec};
use crate::models::ExecutionResult;
use crate::resilience::RetryPolicy;

/// Runs the local pre- and post-processing tools.
///
/// Process failures come back as an unsuccessful [`ExecutionResult`]; only a
/// missing configuration is an error.
pub struct LocalHandler {
    executor: Arc<dyn CommandExecutor>,
    executables: ExecutablesConfig,
    timeout: Duration,
    retry: RetryPolicy,
}

fn render_args(template: &[String], vars: &[(&str, &Path)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), &value.to_string_lossy())
            })
        })
        .collect()
}

impl LocalHandler {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        executables: ExecutablesConfig,
        processing: &ProcessingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            executables,
            timeout: Duration::from_secs(processing.local_execution_timeout_seconds),
            retry,
        }
    }

    pub fn has_interpreter(&self) -> bool {
        self.executables.mqi_interpreter.is_some()
    }

    /// Check that a beam directory exists and can be read.
    pub fn validate_case_structure(&self, path: &Path) -> bool {
        if !path.exists() {
            error!(path = %path.display(), "Case path does not exist");
            return false;
        }
        if !path.is_dir() {
            error!(path = %path.display(), "Case path is not a directory");
            return false;
        }
        match std::fs::read_dir(path) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    warn!(path = %path.display(), "Case directory is empty");
                }
                true
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Case directory is not readable");
                false
            }
        }
    }

    /// Run the input interpreter over `beam_dir`, writing its CSV files to `output_dir`.
    pub async fn run_mqi_interpreter(&self, beam_dir: &Path, output_dir: &Path) -> Result<ExecutionResult> {
        let script = self
            .executables
            .mqi_interpreter
            .as_deref()
            .ok_or_else(|| MqiError::Validation("MQI interpreter path not configured".to_string()))?;
        let args = render_args(
            &self.executables.mqi_interpreter_args,
            &[("beam_dir", beam_dir), ("output_dir", output_dir)],
        );
        self.run_tool("mqi_interpreter", script, args, beam_dir).await
    }

    /// Convert the raw dose file to DICOM inside `output_dir`.
    pub async fn run_raw_to_dcm(
        &self,
        input_file: &Path,
        output_dir: &Path,
        beam_dir: &Path,
    ) -> Result<ExecutionResult> {
        let script = self
            .executables
            .raw_to_dcm
            .as_deref()
            .ok_or_else(|| MqiError::Validation("Raw to DICOM converter path not configured".to_string()))?;
        let args = render_args(
            &self.executables.raw_to_dcm_args,
            &[
                ("input_file", input_file),
                ("output_dir", output_dir),
                ("beam_dir", beam_dir),
            ],
        );
        let cwd = output_dir.parent().unwrap_or(output_dir);
        self.run_tool("raw_to_dcm", script, args, cwd).await
    }

    async fn run_tool(&self, tool: &str, script: &str, args: Vec<String>, cwd: &Path) -> Result<ExecutionResult> {
        let spec = CommandSpec::new(&self.executables.python_interpreter)
            .arg(script)
            .args(args)
            .cwd(cwd)
            .timeout(self.timeout);
        let spec = &spec;
        info!(tool, command = %spec.display(), "Running local tool");

        let outcome = self
            .retry
            .execute(tool, || async move {
                match self.executor.execute(spec).await {
                    Ok(output) => Ok(ExecutionResult {
                        success: output.success(),
                        output: output.stdout,
                        error: output.stderr,
                        return_code: output.status_code,
                    }),
                    Err(CommandError::Io { message }) => Err(MqiError::Retryable(format!(
                        "{} could not be started: {}",
                        tool, message
                    ))),
                    Err(CommandError::CommandNotFound { command }) => Ok(ExecutionResult::failure(
                        format!("Executable not found: {}", command),
                        127,
                    )),
                    Err(CommandError::Timeout { timeout_ms }) => Ok(ExecutionResult::failure(
                        format!("{} timed out after {}ms", tool, timeout_ms),
                        -1,
                    )),
                    Err(CommandError::ExecutionFailed { message }) => {
                        Ok(ExecutionResult::failure(message, -1))
                    }
                }
            })
            .await;

        let result = outcome.unwrap_or_else(|e| ExecutionResult::failure(e.to_string(), -1));
        if result.success {
            debug!(tool, output_len = result.output.len(), "Local tool finished");
        } else {
            error!(
                tool,
                return_code = result.return_code,
                error = %result.failure_reason(),
                "Local tool failed"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ScriptedExecutor;
    use crate::resilience::{BackoffStrategy, RetryConfig};

    fn handler(executor: Arc<ScriptedExecutor>) -> LocalHandler {
        let executables = ExecutablesConfig {
            mqi_interpreter: Some("/opt/mqi/interpreter.py".to_string()),
            raw_to_dcm: Some("/opt/mqi/raw2dcm.py".to_string()),
            ..ExecutablesConfig::default()
        };
        LocalHandler::new(
            executor,
            executables,
            &ProcessingConfig::default(),
            RetryPolicy::new(RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
                strategy: BackoffStrategy::Fixed,
            }),
        )
    }

    #[tokio::test]
    async fn test_interpreter_arguments_are_rendered() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("interpreter.py", 0, "wrote 3 files", "");
        let local = handler(executor.clone());

        let result = local
            .run_mqi_interpreter(Path::new("/data/c1/b1"), Path::new("/data/c1/b1"))
            .await
            .unwrap();
        assert!(result.success);

        let call = &executor.calls()[0];
        assert_eq!(call.program, "python3");
        assert_eq!(
            call.args,
            vec!["/opt/mqi/interpreter.py", "/data/c1/b1", "--output_dir", "/data/c1/b1"]
        );
        assert_eq!(call.cwd.as_deref(), Some(Path::new("/data/c1/b1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failures_are_retried() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail("raw2dcm", CommandError::Io { message: "too many open files".into() });
        executor.respond("raw2dcm", 0, "", "");
        let local = handler(executor.clone());

        let result = local
            .run_raw_to_dcm(
                Path::new("/r/b1/output.raw"),
                Path::new("/r/b1/dcm_output"),
                Path::new("/data/b1"),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(executor.calls().len(), 2);
        assert!(executor.calls()[0].args.contains(&"/r/b1/output.raw".to_string()));
    }

    #[tokio::test]
    async fn test_process_problems_become_failed_results() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail("interpreter.py", CommandError::Timeout { timeout_ms: 300_000 });
        executor.fail("raw2dcm", CommandError::CommandNotFound { command: "python3".into() });
        let local = handler(executor.clone());

        let timed_out = local
            .run_mqi_interpreter(Path::new("/b"), Path::new("/b"))
            .await
            .unwrap();
        assert!(!timed_out.success);
        assert!(timed_out.error.contains("timed out"));

        let missing = local
            .run_raw_to_dcm(Path::new("/b/output.raw"), Path::new("/b/dcm"), Path::new("/b"))
            .await
            .unwrap();
        assert!(!missing.success);
        assert_eq!(missing.return_code, 127);
    }

    #[tokio::test]
    async fn test_unconfigured_tool_is_a_validation_error() {
        let local = LocalHandler::new(
            Arc::new(ScriptedExecutor::new()),
            ExecutablesConfig::default(),
            &ProcessingConfig::default(),
            RetryPolicy::default(),
        );
        assert!(!local.has_interpreter());
        let err = local
            .run_raw_to_dcm(Path::new("/x"), Path::new("/y"), Path::new("/z"))
            .await
            .unwrap_err();
        assert!(matches!(err, MqiError::Validation(_)));
    }

    #[test]
    fn test_validate_case_structure() {
        let dir = tempfile::tempdir().unwrap();
        let local = handler(Arc::new(ScriptedExecutor::new()));
        let file = dir.path().join("plan.dcm");
        std::fs::write(&file, "x").unwrap();

        assert!(local.validate_case_structure(dir.path()));
        assert!(!local.validate_case_structure(&file));
        assert!(!local.validate_case_structure(&dir.path().join("missing")));
    }
}
