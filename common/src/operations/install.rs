// install-package handler

use crate::errors::OperationError;
use crate::executor::process::CommandRunner;
use crate::models::InstallPackage;
use crate::operations::resolver::SourceResolver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct InstallPackageHandler {
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<SourceResolver>,
    installer: String,
    default_arguments: String,
}

impl InstallPackageHandler {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<SourceResolver>,
        installer: impl Into<String>,
        default_arguments: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            resolver,
            installer: installer.into(),
            default_arguments: default_arguments.into(),
        }
    }

    /// Resolve the package and run the installer; stdout is returned on success and failure
    pub async fn execute(
        &self,
        operation: &InstallPackage,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, OperationError> {
        let source = self
            .resolver
            .resolve(
                &operation.source_path,
                operation.expected_checksum.as_deref(),
                cancel,
            )
            .await?;

        let arguments = operation
            .arguments
            .as_deref()
            .unwrap_or(&self.default_arguments);
        let mut args = vec!["/i".to_string(), source.path.display().to_string()];
        args.extend(split_arguments(arguments));

        info!(installer = %self.installer, package = %source.path.display(), "Running package installer");
        let outcome = self.runner.run(&self.installer, &args, cancel).await;
        source.release().await;
        let output = outcome?;

        if output.success() {
            Ok(Some(output.stdout))
        } else {
            warn!(exit_code = output.exit_code, "Package installer failed");
            Err(OperationError::CommandFailed {
                message: format!("Installer exited with code {}", output.exit_code),
                output: Some(output.stdout),
            })
        }
    }
}

/// Split an argument string on whitespace, keeping double-quoted runs together
pub fn split_arguments(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecutionError;
    use crate::executor::process::CommandOutput;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct MockCommandRunner {
        exit_code: i32,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl CommandRunner for MockCommandRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            _cancel: &CancellationToken,
        ) -> Result<CommandOutput, ExecutionError> {
            self.calls
                .lock()
                .await
                .push((program.to_string(), args.to_vec()));
            Ok(CommandOutput {
                exit_code: self.exit_code,
                stdout: "installer log".to_string(),
                stderr: String::new(),
            })
        }
    }

    fn handler(dir: &std::path::Path, exit_code: i32) -> (InstallPackageHandler, Arc<MockCommandRunner>) {
        let runner = Arc::new(MockCommandRunner {
            exit_code,
            calls: Mutex::new(Vec::new()),
        });
        let resolver =
            Arc::new(SourceResolver::new(dir.join("cache"), Duration::from_secs(5)).unwrap());
        let handler =
            InstallPackageHandler::new(runner.clone(), resolver, "msiexec.exe", "/quiet /norestart");
        (handler, runner)
    }

    #[test]
    fn test_split_arguments_respects_quotes() {
        assert_eq!(
            split_arguments(r#"/qn INSTALLDIR="C:\Program Files\Agent" /norestart"#),
            vec!["/qn", r"INSTALLDIR=C:\Program Files\Agent", "/norestart"]
        );
        assert_eq!(split_arguments("  "), Vec::<String>::new());
        assert_eq!(split_arguments(r#"PROP="""#), vec!["PROP="]);
    }

    #[tokio::test]
    async fn test_installer_uses_default_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("agent.msi");
        tokio::fs::write(&package, b"msi").await.unwrap();
        let (handler, runner) = handler(dir.path(), 0);

        let output = handler
            .execute(
                &InstallPackage {
                    source_path: package.display().to_string(),
                    arguments: None,
                    expected_checksum: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.as_deref(), Some("installer log"));
        let calls = runner.calls.lock().await;
        assert_eq!(calls[0].0, "msiexec.exe");
        assert_eq!(
            calls[0].1,
            vec![
                "/i".to_string(),
                package.display().to_string(),
                "/quiet".to_string(),
                "/norestart".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("agent.msi");
        tokio::fs::write(&package, b"msi").await.unwrap();
        let (handler, _) = handler(dir.path(), 1603);

        let err = handler
            .execute(
                &InstallPackage {
                    source_path: package.display().to_string(),
                    arguments: Some("/qn".to_string()),
                    expected_checksum: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            OperationError::CommandFailed { message, output } => {
                assert!(message.contains("1603"));
                assert_eq!(output.as_deref(), Some("installer log"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_never_runs_installer() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("agent.msi");
        tokio::fs::write(&package, b"msi").await.unwrap();
        let (handler, runner) = handler(dir.path(), 0);

        let err = handler
            .execute(
                &InstallPackage {
                    source_path: package.display().to_string(),
                    arguments: None,
                    expected_checksum: Some("00".to_string()),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::Resolve(_)));
        assert!(runner.calls.lock().await.is_empty());
    }
}
