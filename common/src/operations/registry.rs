// set-registry-value handler
// Writes are restricted to the machine hive and issued through the registry tool.

use crate::errors::{OperationError, ValidationError};
use crate::executor::process::CommandRunner;
use crate::models::{RegistryValueKind, SetRegistryValue};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const MACHINE_HIVE_PREFIXES: &[&str] = &["HKLM\\", "HKLM:\\", "HKEY_LOCAL_MACHINE\\"];

pub struct RegistryHandler {
    runner: Arc<dyn CommandRunner>,
    registry_tool: String,
}

impl RegistryHandler {
    pub fn new(runner: Arc<dyn CommandRunner>, registry_tool: impl Into<String>) -> Self {
        Self {
            runner,
            registry_tool: registry_tool.into(),
        }
    }

    pub async fn execute(
        &self,
        operation: &SetRegistryValue,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, OperationError> {
        let key = machine_hive_key(&operation.path)?;
        let data = coerce_value(&operation.value, operation.kind)?;

        let args = vec![
            "add".to_string(),
            key.clone(),
            "/v".to_string(),
            operation.name.clone(),
            "/t".to_string(),
            reg_type_name(operation.kind).to_string(),
            "/d".to_string(),
            data,
            "/f".to_string(),
        ];

        let output = self.runner.run(&self.registry_tool, &args, cancel).await?;
        if !output.success() {
            return Err(OperationError::CommandFailed {
                message: format!(
                    "Failed to set registry value {}\\{} (exit code {})",
                    key, operation.name, output.exit_code
                ),
                output: Some(format!("{}{}", output.stdout, output.stderr)),
            });
        }

        info!(key = %key, name = %operation.name, kind = ?operation.kind, "Registry value set");
        Ok(Some(format!(
            "Set registry value: {}\\{} = {}",
            key, operation.name, operation.value
        )))
    }
}

/// Normalize a machine-hive path to `HKLM\...`; any other root is rejected
pub fn machine_hive_key(path: &str) -> Result<String, ValidationError> {
    let trimmed = path.trim();
    for prefix in MACHINE_HIVE_PREFIXES {
        if trimmed.len() >= prefix.len()
            && trimmed.is_char_boundary(prefix.len())
            && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            let rest = trimmed[prefix.len()..].trim_matches('\\');
            if rest.is_empty() {
                break;
            }
            return Ok(format!("HKLM\\{}", rest));
        }
    }
    Err(ValidationError::NonMachineHive(path.to_string()))
}

fn reg_type_name(kind: RegistryValueKind) -> &'static str {
    match kind {
        RegistryValueKind::Dword => "REG_DWORD",
        RegistryValueKind::Qword => "REG_QWORD",
        RegistryValueKind::String => "REG_SZ",
        RegistryValueKind::ExpandString => "REG_EXPAND_SZ",
    }
}

/// Render `value` as registry tool data for `kind`; integers accept decimal or 0x hex
pub fn coerce_value(value: &str, kind: RegistryValueKind) -> Result<String, ValidationError> {
    let invalid = |expected: &str| ValidationError::InvalidFieldValue {
        field: "value".to_string(),
        reason: format!("'{}' is not a valid {}", value, expected),
    };

    match kind {
        RegistryValueKind::Dword => {
            let parsed = parse_integer(value).ok_or_else(|| invalid("32-bit integer"))?;
            let bits = if let Ok(signed) = i32::try_from(parsed) {
                signed as u32
            } else {
                u32::try_from(parsed).map_err(|_| invalid("32-bit integer"))?
            };
            Ok(bits.to_string())
        }
        RegistryValueKind::Qword => {
            let parsed = parse_integer(value).ok_or_else(|| invalid("64-bit integer"))?;
            let bits = if let Ok(signed) = i64::try_from(parsed) {
                signed as u64
            } else {
                u64::try_from(parsed).map_err(|_| invalid("64-bit integer"))?
            };
            Ok(bits.to_string())
        }
        RegistryValueKind::String | RegistryValueKind::ExpandString => Ok(value.to_string()),
    }
}

fn parse_integer(value: &str) -> Option<i128> {
    let value = value.trim();
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i128>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecutionError;
    use crate::executor::process::CommandOutput;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MockCommandRunner {
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
            Ok(CommandOutput::default())
        }
    }

    fn operation(path: &str, value: &str, kind: RegistryValueKind) -> SetRegistryValue {
        SetRegistryValue {
            path: path.to_string(),
            name: "Level".to_string(),
            value: value.to_string(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_user_hive_rejected_before_any_write() {
        let runner = Arc::new(MockCommandRunner::default());
        let handler = RegistryHandler::new(runner.clone(), "reg.exe");

        let err = handler
            .execute(
                &operation("HKCU\\Software\\Agent", "1", RegistryValueKind::Dword),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("HKLM"));
        assert!(runner.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dword_write_arguments() {
        let runner = Arc::new(MockCommandRunner::default());
        let handler = RegistryHandler::new(runner.clone(), "reg.exe");

        handler
            .execute(
                &operation("HKEY_LOCAL_MACHINE\\Software\\Agent", "-1", RegistryValueKind::Dword),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let calls = runner.calls.lock().await;
        assert_eq!(
            calls[0],
            vec![
                "add",
                "HKLM\\Software\\Agent",
                "/v",
                "Level",
                "/t",
                "REG_DWORD",
                "/d",
                "4294967295",
                "/f"
            ]
        );
    }

    #[test]
    fn test_machine_hive_normalization() {
        assert_eq!(machine_hive_key("hklm\\Software\\X").unwrap(), "HKLM\\Software\\X");
        assert_eq!(machine_hive_key("HKLM:\\Software\\X\\").unwrap(), "HKLM\\Software\\X");
        assert!(machine_hive_key("HKLM\\").is_err());
        assert!(machine_hive_key("HKLMX\\Software").is_err());
        assert!(machine_hive_key("HKEY_CURRENT_USER\\Software").is_err());
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(coerce_value("0x10", RegistryValueKind::Dword).unwrap(), "16");
        assert_eq!(coerce_value("4294967295", RegistryValueKind::Dword).unwrap(), "4294967295");
        assert!(coerce_value("4294967296", RegistryValueKind::Dword).is_err());
        assert!(coerce_value("abc", RegistryValueKind::Qword).is_err());
        assert_eq!(
            coerce_value("-2", RegistryValueKind::Qword).unwrap(),
            "18446744073709551614"
        );
        assert_eq!(
            coerce_value("%ProgramData%\\x", RegistryValueKind::ExpandString).unwrap(),
            "%ProgramData%\\x"
        );
    }
}
