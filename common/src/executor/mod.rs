// Executor module for script execution
// Provides the executor trait, the safety gate and child process plumbing

pub mod process;
pub mod safety;
pub mod script;

use crate::models::ExecutionResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub use process::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use safety::ScriptSafetyPolicy;
pub use script::{ConsoleSessionLocator, PrivilegedScriptExecutor, ScriptInterpreter, SessionLocator};

/// Named script parameters, passed to the interpreter in key order
pub type ScriptParameters = BTreeMap<String, String>;

/// ScriptExecutor runs an automation script under a given identity.
///
/// Every method returns a result rather than an error: rejections, spawn failures and
/// cancellation are all reported through [`ExecutionResult`].
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run under the service's own identity
    async fn execute_elevated(
        &self,
        script_path: &Path,
        parameters: &ScriptParameters,
        cancel: &CancellationToken,
    ) -> ExecutionResult;

    /// Run inside a user session; `None` targets the active console session
    async fn execute_as_user(
        &self,
        script_path: &Path,
        parameters: &ScriptParameters,
        session_id: Option<u32>,
        cancel: &CancellationToken,
    ) -> ExecutionResult;

    async fn validate_script_safety(&self, script_path: &Path) -> bool;
}
