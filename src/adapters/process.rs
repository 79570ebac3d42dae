//! Process-backed stage executor.
//!
//! Runs each invocation of a stage as a child process inside the stage's
//! working directory. The whole command shares one wall-clock budget; when
//! it runs out the pending child is dropped and, with `kill_on_drop`, killed.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::core::limits::ResourceLimits;
use crate::core::materialize::Invocation;
use crate::domain::FailureCause;

use super::{ExecutionOutput, StageExecutor, StageJob};

/// Lines of stderr kept for failure messages
const STDERR_TAIL_LINES: usize = 20;

/// Script written next to the stage's outputs for inspection
pub const COMMAND_SCRIPT: &str = ".command.sh";

/// Executor spawning the stage's tools as subprocesses
pub struct ProcessExecutor {
    /// Exported to tools as RNADESEQ_MAX_MEMORY
    max_memory: String,

    /// Exported to tools as RNADESEQ_MAX_CPUS
    max_cpus: u32,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(&ResourceLimits::default())
    }
}

impl ProcessExecutor {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            max_memory: limits.max_memory.clone(),
            max_cpus: limits.max_cpus,
        }
    }

    async fn run_invocation(
        &self,
        invocation: &Invocation,
        workdir: &Path,
    ) -> Result<String, FailureCause> {
        let stdout = match &invocation.stdout {
            Some(file) => {
                let path = workdir.join(file);
                let file = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| FailureCause::Staging {
                        message: format!("cannot create {}: {}", path.display(), e),
                    })?;
                Stdio::from(file.into_std().await)
            }
            None => Stdio::null(),
        };

        debug!(program = %invocation.program, workdir = %workdir.display(), "Spawning tool");

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(workdir)
            .env("RNADESEQ_MAX_MEMORY", &self.max_memory)
            .env("RNADESEQ_MAX_CPUS", self.max_cpus.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FailureCause::Launch {
                program: invocation.program.clone(),
                message: e.to_string(),
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FailureCause::Launch {
                program: invocation.program.clone(),
                message: e.to_string(),
            })?;

        let stderr = tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES);

        if !output.status.success() {
            return Err(FailureCause::ExitStatus {
                program: invocation.program.clone(),
                code: exit_code(&output.status),
                stderr,
            });
        }

        Ok(stderr)
    }
}

/// Exit code, with signals reported the way shells do (128 + signal)
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[async_trait]
impl StageExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, job: &StageJob) -> Result<ExecutionOutput, FailureCause> {
        let script = job.workdir.join(COMMAND_SCRIPT);
        tokio::fs::write(&script, format!("{}\n", job.command.render()))
            .await
            .map_err(|e| FailureCause::Staging {
                message: format!("cannot write {}: {}", script.display(), e),
            })?;

        let run = async {
            let mut stderr_tail = String::new();
            for invocation in &job.command.invocations {
                stderr_tail = self.run_invocation(invocation, &job.workdir).await?;
            }
            Ok::<_, FailureCause>(ExecutionOutput { stderr_tail })
        };

        match timeout(job.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(FailureCause::TimedOut {
                limit_seconds: job.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::materialize::CommandSpec;
    use std::time::Duration;
    use tempfile::TempDir;

    fn job(workdir: &Path, invocations: Vec<Invocation>, limit: Duration) -> StageJob {
        StageJob {
            stage_name: "test".to_string(),
            command: CommandSpec { invocations },
            workdir: workdir.to_path_buf(),
            outputs: Vec::new(),
            timeout: limit,
            attempt: 1,
        }
    }

    fn sh(script: &str) -> Invocation {
        Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            stdout: None,
        }
    }

    #[tokio::test]
    async fn test_stdout_capture_and_script() {
        let temp = TempDir::new().unwrap();
        let echo = Invocation {
            program: "echo".to_string(),
            args: vec!["0.1.0".to_string()],
            stdout: Some("v_pipeline.txt".into()),
        };

        ProcessExecutor::default()
            .execute(&job(temp.path(), vec![echo], Duration::from_secs(10)))
            .await
            .unwrap();

        let captured = std::fs::read_to_string(temp.path().join("v_pipeline.txt")).unwrap();
        assert_eq!(captured.trim(), "0.1.0");
        assert!(temp.path().join(COMMAND_SCRIPT).exists());
    }

    #[tokio::test]
    async fn test_exit_status_carries_stderr() {
        let temp = TempDir::new().unwrap();
        let err = ProcessExecutor::default()
            .execute(&job(
                temp.path(),
                vec![sh("echo 'design matrix not full rank' >&2; exit 3")],
                Duration::from_secs(10),
            ))
            .await
            .unwrap_err();

        match err {
            FailureCause::ExitStatus { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("not full rank"));
            }
            other => panic!("unexpected failure {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_later_invocations_stop_after_failure() {
        let temp = TempDir::new().unwrap();
        let _ = ProcessExecutor::default()
            .execute(&job(
                temp.path(),
                vec![sh("exit 1"), sh("touch ran")],
                Duration::from_secs(10),
            ))
            .await;

        assert!(!temp.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_timeout() {
        let temp = TempDir::new().unwrap();
        let err = ProcessExecutor::default()
            .execute(&job(
                temp.path(),
                vec![sh("sleep 5")],
                Duration::from_millis(100),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, FailureCause::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let temp = TempDir::new().unwrap();
        let missing = Invocation {
            program: "definitely-not-a-real-tool".to_string(),
            args: Vec::new(),
            stdout: None,
        };
        let err = ProcessExecutor::default()
            .execute(&job(temp.path(), vec![missing], Duration::from_secs(10)))
            .await
            .unwrap_err();

        assert!(matches!(err, FailureCause::Launch { .. }));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("", 2), "");
    }
}
