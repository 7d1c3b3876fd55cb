// manage-service handler
// Each requested change is a separate service-control call; all are attempted.

use crate::errors::{ExecutionError, OperationError};
use crate::executor::process::CommandRunner;
use crate::models::{ManageService, ServiceState, StartupType};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ServiceHandler {
    runner: Arc<dyn CommandRunner>,
    service_control: String,
}

impl ServiceHandler {
    pub fn new(runner: Arc<dyn CommandRunner>, service_control: impl Into<String>) -> Self {
        Self {
            runner,
            service_control: service_control.into(),
        }
    }

    pub async fn execute(
        &self,
        operation: &ManageService,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, OperationError> {
        let commands = service_commands(operation);
        if commands.is_empty() {
            info!(service = %operation.service_name, "No service changes requested");
            return Ok(None);
        }

        let mut transcript = Vec::with_capacity(commands.len());
        let mut failures = Vec::new();

        for args in &commands {
            let command_line = format!("{} {}", self.service_control, args.join(" "));
            match self.runner.run(&self.service_control, args, cancel).await {
                Ok(output) => {
                    transcript.push(format!(
                        "Command: {}\nOutput: {}{}",
                        command_line,
                        output.stdout.trim_end(),
                        output.stderr.trim_end()
                    ));
                    if !output.success() {
                        failures.push(format!(
                            "'{}' exited with code {}",
                            command_line, output.exit_code
                        ));
                    }
                }
                Err(ExecutionError::Cancelled) => {
                    return Err(ExecutionError::Cancelled.into());
                }
                Err(e) => {
                    transcript.push(format!("Command: {}\nError: {}", command_line, e));
                    failures.push(format!("'{}' failed: {}", command_line, e));
                }
            }
        }

        let output = transcript.join("\n\n");
        if failures.is_empty() {
            info!(service = %operation.service_name, commands = commands.len(), "Service configured");
            Ok(Some(output))
        } else {
            warn!(service = %operation.service_name, failed = failures.len(), "Service control failed");
            Err(OperationError::CommandFailed {
                message: format!(
                    "Service '{}' configuration failed: {}",
                    operation.service_name,
                    failures.join("; ")
                ),
                output: Some(output),
            })
        }
    }
}

/// Service-control argument lists for the requested changes, startup type first
pub fn service_commands(operation: &ManageService) -> Vec<Vec<String>> {
    let name = operation.service_name.clone();
    let mut commands = Vec::new();

    if let Some(startup_type) = operation.startup_type {
        let mode = match startup_type {
            StartupType::Automatic => "auto",
            StartupType::Manual => "demand",
            StartupType::Disabled => "disabled",
        };
        commands.push(vec![
            "config".to_string(),
            name.clone(),
            "start=".to_string(),
            mode.to_string(),
        ]);
    }

    if let Some(state) = operation.state {
        let verb = match state {
            ServiceState::Running => "start",
            ServiceState::Stopped => "stop",
        };
        commands.push(vec![verb.to_string(), name]);
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::process::CommandOutput;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Fails any call whose verb is listed in `failing`
    struct MockCommandRunner {
        failing: Vec<&'static str>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for MockCommandRunner {
        async fn run(
            &self,
            _program: &str,
            args: &[String],
            _cancel: &CancellationToken,
        ) -> Result<CommandOutput, ExecutionError> {
            self.calls.lock().await.push(args.to_vec());
            let fail = self.failing.contains(&args[0].as_str());
            Ok(CommandOutput {
                exit_code: if fail { 1056 } else { 0 },
                stdout: format!("{} done", args[0]),
                stderr: String::new(),
            })
        }
    }

    fn operation() -> ManageService {
        ManageService {
            service_name: "Spooler".to_string(),
            state: Some(ServiceState::Running),
            startup_type: Some(StartupType::Automatic),
        }
    }

    #[test]
    fn test_commands_for_requested_changes() {
        assert_eq!(
            service_commands(&operation()),
            vec![
                vec!["config", "Spooler", "start=", "auto"],
                vec!["start", "Spooler"]
            ]
        );
        let none = ManageService {
            service_name: "Spooler".to_string(),
            state: None,
            startup_type: None,
        };
        assert!(service_commands(&none).is_empty());
    }

    #[tokio::test]
    async fn test_all_subcommands_attempted_after_failure() {
        let runner = Arc::new(MockCommandRunner {
            failing: vec!["config"],
            calls: Mutex::new(Vec::new()),
        });
        let handler = ServiceHandler::new(runner.clone(), "sc.exe");

        let err = handler
            .execute(&operation(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(runner.calls.lock().await.len(), 2);
        match err {
            OperationError::CommandFailed { message, output } => {
                assert!(message.contains("1056"));
                let output = output.unwrap();
                assert!(output.contains("Command: sc.exe config Spooler start= auto\nOutput: config done"));
                assert!(output.contains("\n\nCommand: sc.exe start Spooler\nOutput: start done"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_concatenates_outputs() {
        let runner = Arc::new(MockCommandRunner {
            failing: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let handler = ServiceHandler::new(runner, "sc.exe");

        let output = handler
            .execute(&operation(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.matches("Command: ").count(), 2);
    }
}
