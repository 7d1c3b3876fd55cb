// Privileged script executor
// Runs allow-listed automation scripts as the service identity or inside a user session.

use crate::config::ExecutorSettings;
use crate::errors::{ExecutionError, ValidationError};
use crate::executor::process::{run_captured, CommandRunner};
use crate::executor::safety::ScriptSafetyPolicy;
use crate::executor::{ScriptExecutor, ScriptParameters};
use crate::models::{ExecutionContext, ExecutionResult};
use crate::telemetry;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SECURITY_VALIDATION_FAILED: &str = "Script failed security validation";

const POWERSHELL_POLICY_ARGS: [&str; 3] = ["-NonInteractive", "-ExecutionPolicy", "Bypass"];

/// Interpreter program plus the fixed arguments placed before the script path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInterpreter {
    pub program: String,
    pub args: Vec<String>,
}

impl ScriptInterpreter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// PowerShell hosts (`powershell`, `pwsh`) get the non-interactive bypass policy enforced
    pub fn is_powershell(&self) -> bool {
        let name = self
            .program
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let stem = name.strip_suffix(".exe").unwrap_or(&name);
        stem == "powershell" || stem == "pwsh"
    }

    /// Configured args, with `-NonInteractive -ExecutionPolicy Bypass` forced for PowerShell
    fn fixed_args(&self) -> Vec<String> {
        if !self.is_powershell() {
            return self.args.clone();
        }

        let mut args: Vec<String> = POWERSHELL_POLICY_ARGS.iter().map(|a| a.to_string()).collect();
        let mut configured = self.args.iter();
        while let Some(arg) = configured.next() {
            if arg.eq_ignore_ascii_case("-NonInteractive") {
                continue;
            }
            if arg.eq_ignore_ascii_case("-ExecutionPolicy") {
                // Drop the configured policy value along with the switch
                configured.next();
                continue;
            }
            args.push(arg.clone());
        }
        args
    }

    /// Full argument list: fixed args, script path, then `-Name value` pairs in key order
    pub fn arguments(&self, script_path: &Path, parameters: &ScriptParameters) -> Vec<String> {
        let mut args = self.fixed_args();
        args.push(script_path.display().to_string());
        for (name, value) in parameters {
            args.push(format!("-{}", name));
            args.push(value.clone());
        }
        args
    }
}

/// Resolves the interactive console session a user-context script should run in
#[async_trait]
pub trait SessionLocator: Send + Sync {
    async fn active_console_session(&self) -> Option<u32>;
}

/// Finds the active session by asking the host (`query session`)
pub struct ConsoleSessionLocator {
    runner: Arc<dyn CommandRunner>,
}

impl ConsoleSessionLocator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl SessionLocator for ConsoleSessionLocator {
    async fn active_console_session(&self) -> Option<u32> {
        let cancel = CancellationToken::new();
        match self
            .runner
            .run("query", &["session".to_string()], &cancel)
            .await
        {
            Ok(output) => parse_query_session(&output.stdout),
            Err(e) => {
                warn!(error = %e, "Unable to enumerate user sessions");
                None
            }
        }
    }
}

/// Pick the active session id from `query session` output, preferring the console
pub fn parse_query_session(output: &str) -> Option<u32> {
    let mut first_active = None;

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(state_index) = tokens
            .iter()
            .position(|token| token.eq_ignore_ascii_case("Active"))
        else {
            continue;
        };
        if state_index == 0 {
            continue;
        }
        let Ok(id) = tokens[state_index - 1].parse::<u32>() else {
            continue;
        };

        let is_console = tokens
            .first()
            .map(|name| name.trim_start_matches('>').eq_ignore_ascii_case("console"))
            .unwrap_or(false);
        if is_console {
            return Some(id);
        }
        first_active.get_or_insert(id);
    }

    first_active
}

/// Script executor that gates every run through a [`ScriptSafetyPolicy`]
pub struct PrivilegedScriptExecutor {
    interpreter: ScriptInterpreter,
    session_launcher: Option<Vec<String>>,
    policy: Arc<ScriptSafetyPolicy>,
    sessions: Arc<dyn SessionLocator>,
}

impl PrivilegedScriptExecutor {
    pub fn new(
        interpreter: ScriptInterpreter,
        policy: Arc<ScriptSafetyPolicy>,
        sessions: Arc<dyn SessionLocator>,
    ) -> Self {
        Self {
            interpreter,
            session_launcher: None,
            policy,
            sessions,
        }
    }

    /// Build from service settings, compiling the allow-list and deny-list once
    pub fn from_settings(
        settings: &ExecutorSettings,
        secure_root: &Path,
        sessions: Arc<dyn SessionLocator>,
    ) -> Result<Self, ValidationError> {
        let policy = ScriptSafetyPolicy::new(
            secure_root,
            &settings.allowed_scripts,
            &settings.denied_patterns,
        )?;
        let interpreter =
            ScriptInterpreter::new(settings.interpreter.clone(), settings.interpreter_args.clone());

        Ok(Self::new(interpreter, Arc::new(policy), sessions)
            .with_session_launcher(settings.session_launcher.clone()))
    }

    /// Command prefix that places the interpreter into a user session; `{session}` is substituted
    pub fn with_session_launcher(mut self, launcher: Option<Vec<String>>) -> Self {
        self.session_launcher = launcher.filter(|parts| !parts.is_empty());
        self
    }

    pub fn policy(&self) -> &ScriptSafetyPolicy {
        &self.policy
    }

    fn build_command(
        &self,
        script_path: &Path,
        parameters: &ScriptParameters,
        session_id: Option<u32>,
    ) -> Command {
        let interpreter_args = self.interpreter.arguments(script_path, parameters);

        match (&self.session_launcher, session_id) {
            (Some(launcher), Some(session)) => {
                let session = session.to_string();
                let mut parts = launcher.iter().map(|part| part.replace("{session}", &session));
                // Launcher is never empty, see with_session_launcher
                let program = parts.next().unwrap_or_default();
                let mut command = Command::new(program);
                command.args(parts);
                command.arg(&self.interpreter.program);
                command.args(interpreter_args);
                command
            }
            _ => {
                let mut command = Command::new(&self.interpreter.program);
                command.args(interpreter_args);
                command
            }
        }
    }

    async fn run(
        &self,
        context: ExecutionContext,
        script_path: &Path,
        parameters: &ScriptParameters,
        session_id: Option<u32>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::started(context);
        result.session_id = session_id;

        let command = self.build_command(script_path, parameters, session_id);
        let result = match run_captured(command, cancel).await {
            Ok(output) => {
                result.exit_code = output.exit_code;
                result.output = output.stdout;
                result.error = output.stderr;
                result.finish()
            }
            Err(ExecutionError::Cancelled) => {
                info!(script = %script_path.display(), context = %context, "Script execution cancelled");
                result.cancel()
            }
            Err(e) => {
                error!(script = %script_path.display(), context = %context, error = %e, "Script execution failed");
                result.fail(e.to_string())
            }
        };

        self.report(script_path, &result);
        result
    }

    fn report(&self, script_path: &Path, result: &ExecutionResult) {
        let duration = result.duration();
        telemetry::record_script_execution(
            result.context.as_str(),
            result.success(),
            duration.num_milliseconds() as f64 / 1000.0,
        );

        if result.cancelled {
            return;
        }
        if result.success() {
            info!(
                script = %script_path.display(),
                context = %result.context,
                exit_code = result.exit_code,
                duration_ms = duration.num_milliseconds(),
                "Script completed"
            );
        } else {
            warn!(
                script = %script_path.display(),
                context = %result.context,
                exit_code = result.exit_code,
                duration_ms = duration.num_milliseconds(),
                stderr_len = result.error.len(),
                "Script completed with errors"
            );
        }
    }

    async fn rejected(&self, context: ExecutionContext, script_path: &Path) -> Option<ExecutionResult> {
        if self.policy.validate(script_path).await {
            return None;
        }
        let result = ExecutionResult::started(context).fail(SECURITY_VALIDATION_FAILED);
        telemetry::record_script_execution(context.as_str(), false, 0.0);
        Some(result)
    }
}

#[async_trait]
impl ScriptExecutor for PrivilegedScriptExecutor {
    #[tracing::instrument(skip(self, parameters, cancel), fields(script = %script_path.display()))]
    async fn execute_elevated(
        &self,
        script_path: &Path,
        parameters: &ScriptParameters,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        if let Some(rejected) = self.rejected(ExecutionContext::Elevated, script_path).await {
            return rejected;
        }

        debug!("Executing script in elevated context");
        self.run(ExecutionContext::Elevated, script_path, parameters, None, cancel)
            .await
    }

    #[tracing::instrument(skip(self, parameters, cancel), fields(script = %script_path.display()))]
    async fn execute_as_user(
        &self,
        script_path: &Path,
        parameters: &ScriptParameters,
        session_id: Option<u32>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        if let Some(rejected) = self.rejected(ExecutionContext::User, script_path).await {
            return rejected;
        }

        let session = match session_id {
            Some(id) => id,
            None => match self.sessions.active_console_session().await {
                Some(id) => id,
                None => {
                    warn!("No active user session; skipping user-context script");
                    telemetry::record_script_execution(ExecutionContext::User.as_str(), false, 0.0);
                    return ExecutionResult::started(ExecutionContext::User)
                        .fail(ExecutionError::NoActiveSession.to_string());
                }
            },
        };

        debug!(session_id = session, "Executing script in user session");
        self.run(ExecutionContext::User, script_path, parameters, Some(session), cancel)
            .await
    }

    async fn validate_script_safety(&self, script_path: &Path) -> bool {
        self.policy.validate(script_path).await
    }
}
