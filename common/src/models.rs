use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Script Execution Models
// ============================================================================

/// Identity a script runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    /// The service's own administrative identity
    Elevated,
    /// A logged-on user's interactive session
    User,
}

impl ExecutionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionContext::Elevated => "elevated",
            ExecutionContext::User => "user",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one script execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub context: ExecutionContext,
    pub exit_code: i32,
    pub output: String,
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u32>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ExecutionResult {
    /// A fresh result stamped with the current time
    pub fn started(context: ExecutionContext) -> Self {
        let now = Utc::now();
        Self {
            context,
            exit_code: 0,
            output: String::new(),
            error: String::new(),
            started_at: now,
            completed_at: now,
            session_id: None,
            cancelled: false,
        }
    }

    /// Mark the result as a failure that never reached (or never finished) a process
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.exit_code = -1;
        self.error = error.into();
        self.finish()
    }

    /// Mark the result as a cancelled run
    pub fn cancel(mut self) -> Self {
        self.cancelled = true;
        self.fail("Execution cancelled")
    }

    pub fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        self
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_empty()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

// ============================================================================
// System Operations Manifest Models
// ============================================================================

/// Root object of the system operations manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub operations: Vec<ManifestEntry>,
}

/// A single manifest entry as authored; parameters are interpreted per type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "operationType")]
    pub operation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Closed set of supported operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    InstallPackage,
    SetRegistryValue,
    ManageService,
    CopyFile,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::InstallPackage => "install-package",
            OperationType::SetRegistryValue => "set-registry-value",
            OperationType::ManageService => "manage-service",
            OperationType::CopyFile => "copy-file",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ValidationError;

    /// Accepts kebab-case, snake_case and the camel-case manifest spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "installpackage" | "installmsi" => Ok(OperationType::InstallPackage),
            "setregistryvalue" => Ok(OperationType::SetRegistryValue),
            "manageservice" => Ok(OperationType::ManageService),
            "copyfile" => Ok(OperationType::CopyFile),
            _ => Err(ValidationError::UnknownOperationType(s.to_string())),
        }
    }
}

/// Registry value kinds understood by the registry handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryValueKind {
    Dword,
    Qword,
    String,
    ExpandString,
}

impl RegistryValueKind {
    /// Unrecognized kinds fall back to a plain string
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "dword" | "reg_dword" => RegistryValueKind::Dword,
            "qword" | "reg_qword" => RegistryValueKind::Qword,
            "expandstring" | "expandable" | "reg_expand_sz" => RegistryValueKind::ExpandString,
            _ => RegistryValueKind::String,
        }
    }
}

/// Target run state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Running,
    Stopped,
}

impl FromStr for ServiceState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(ServiceState::Running),
            "stopped" => Ok(ServiceState::Stopped),
            other => Err(ValidationError::InvalidFieldValue {
                field: "state".to_string(),
                reason: format!("expected running or stopped, got '{}'", other),
            }),
        }
    }
}

/// Service startup type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupType {
    Automatic,
    Manual,
    Disabled,
}

impl FromStr for StartupType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "automatic" | "auto" => Ok(StartupType::Automatic),
            "manual" | "demand" => Ok(StartupType::Manual),
            "disabled" => Ok(StartupType::Disabled),
            other => Err(ValidationError::InvalidFieldValue {
                field: "startupType".to_string(),
                reason: format!("expected automatic, manual or disabled, got '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPackage {
    pub source_path: String,
    pub arguments: Option<String>,
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRegistryValue {
    pub path: String,
    pub name: String,
    pub value: String,
    pub kind: RegistryValueKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManageService {
    pub service_name: String,
    pub state: Option<ServiceState>,
    pub startup_type: Option<StartupType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFile {
    pub source_path: String,
    pub destination_path: String,
    pub overwrite: bool,
    pub expected_checksum: Option<String>,
}

/// A manifest entry with its parameter bag parsed into the typed shape for its type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemOperation {
    InstallPackage(InstallPackage),
    SetRegistryValue(SetRegistryValue),
    ManageService(ManageService),
    CopyFile(CopyFile),
}

impl SystemOperation {
    pub fn operation_type(&self) -> OperationType {
        match self {
            SystemOperation::InstallPackage(_) => OperationType::InstallPackage,
            SystemOperation::SetRegistryValue(_) => OperationType::SetRegistryValue,
            SystemOperation::ManageService(_) => OperationType::ManageService,
            SystemOperation::CopyFile(_) => OperationType::CopyFile,
        }
    }

    /// Parse an entry's parameter bag, checking every required key up front
    pub fn from_entry(entry: &ManifestEntry) -> Result<Self, ValidationError> {
        let operation_type: OperationType = entry.operation_type.parse()?;
        let params = &entry.parameters;

        let operation = match operation_type {
            OperationType::InstallPackage => SystemOperation::InstallPackage(InstallPackage {
                source_path: required_param(params, "sourcePath")?,
                arguments: optional_param(params, "arguments"),
                expected_checksum: checksum_param(params),
            }),
            OperationType::SetRegistryValue => {
                let path = required_param(params, "path")?;
                let name = required_param(params, "name")?;
                // An empty string is a legitimate registry value
                let value = string_param(params, "value")
                    .ok_or_else(|| ValidationError::MissingField("value".to_string()))?;
                let kind = RegistryValueKind::parse_lenient(&required_param(params, "regType")?);
                SystemOperation::SetRegistryValue(SetRegistryValue {
                    path,
                    name,
                    value,
                    kind,
                })
            }
            OperationType::ManageService => SystemOperation::ManageService(ManageService {
                service_name: required_param(params, "serviceName")?,
                state: optional_param(params, "state")
                    .map(|s| s.parse())
                    .transpose()?,
                startup_type: optional_param(params, "startupType")
                    .map(|s| s.parse())
                    .transpose()?,
            }),
            OperationType::CopyFile => SystemOperation::CopyFile(CopyFile {
                source_path: required_param(params, "sourcePath")?,
                destination_path: required_param(params, "destinationPath")?,
                overwrite: bool_param(params, "overwrite")?.unwrap_or(false),
                expected_checksum: checksum_param(params),
            }),
        };

        Ok(operation)
    }
}

/// Render a scalar parameter as a string; arrays, objects and null are absent
fn string_param(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn optional_param(params: &Map<String, Value>, key: &str) -> Option<String> {
    string_param(params, key).filter(|s| !s.trim().is_empty())
}

fn required_param(params: &Map<String, Value>, key: &str) -> Result<String, ValidationError> {
    optional_param(params, key).ok_or_else(|| ValidationError::MissingField(key.to_string()))
}

fn checksum_param(params: &Map<String, Value>) -> Option<String> {
    optional_param(params, "expectedChecksum").or_else(|| optional_param(params, "checksum"))
}

fn bool_param(params: &Map<String, Value>, key: &str) -> Result<Option<bool>, ValidationError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(Some(true)),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") || s.is_empty() => {
            Ok(Some(false))
        }
        Some(other) => Err(ValidationError::InvalidFieldValue {
            field: key.to_string(),
            reason: format!("expected a boolean, got {}", other),
        }),
    }
}

// ============================================================================
// Operation Result Models
// ============================================================================

/// Outcome of one manifest entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub operation_type: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl OperationResult {
    pub fn started(operation_id: &str, operation_type: &str) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation_id.to_string(),
            operation_type: operation_type.to_string(),
            success: false,
            error: None,
            output: None,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn succeed(mut self, output: Option<String>) -> Self {
        self.success = true;
        self.output = output;
        self.completed_at = Utc::now();
        self
    }

    pub fn fail(mut self, error: impl Into<String>, output: Option<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self.output = output;
        self.completed_at = Utc::now();
        self
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// Aggregate outcome of one manifest processing pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    /// In manifest order
    pub results: Vec<OperationResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
}

impl BatchResult {
    pub fn started() -> Self {
        let now = Utc::now();
        Self {
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            results: Vec::new(),
            started_at: now,
            completed_at: now,
            cancelled: false,
        }
    }

    pub fn push(&mut self, result: OperationResult) {
        self.total_operations += 1;
        if result.success {
            self.successful_operations += 1;
        } else {
            self.failed_operations += 1;
        }
        self.results.push(result);
    }

    pub fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        self
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(operation_type: &str, parameters: Value) -> ManifestEntry {
        ManifestEntry {
            id: "op-1".to_string(),
            operation_type: operation_type.to_string(),
            comment: None,
            parameters: parameters.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_execution_result_success_requires_empty_stderr() {
        let mut result = ExecutionResult::started(ExecutionContext::User);
        assert!(result.success());
        result.error = "warning".to_string();
        assert!(!result.success());
    }

    #[test]
    fn test_cancelled_execution_is_not_success() {
        let result = ExecutionResult::started(ExecutionContext::Elevated).cancel();
        assert!(result.cancelled);
        assert_eq!(result.exit_code, -1);
        assert!(!result.success());
    }

    #[test]
    fn test_operation_type_accepts_all_spellings() {
        for name in ["install-package", "installMsi", "INSTALL_PACKAGE"] {
            assert_eq!(name.parse::<OperationType>().unwrap(), OperationType::InstallPackage);
        }
        assert_eq!(
            "setRegistryValue".parse::<OperationType>().unwrap(),
            OperationType::SetRegistryValue
        );
        assert_eq!("copyFile".parse::<OperationType>().unwrap(), OperationType::CopyFile);
        assert!("rebootHost".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_parse_install_with_checksum_alias() {
        let op = SystemOperation::from_entry(&entry(
            "installMsi",
            json!({"sourcePath": "C:\\pkg.msi", "checksum": "ABC"}),
        ))
        .unwrap();
        match op {
            SystemOperation::InstallPackage(install) => {
                assert_eq!(install.expected_checksum.as_deref(), Some("ABC"));
                assert!(install.arguments.is_none());
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_required_field() {
        let err = SystemOperation::from_entry(&entry("copy-file", json!({"sourcePath": "a"})))
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("destinationPath".to_string()));
    }

    #[test]
    fn test_parse_registry_value_coerces_numbers_and_empty_strings() {
        let op = SystemOperation::from_entry(&entry(
            "set-registry-value",
            json!({"path": "HKLM\\Software\\X", "name": "N", "value": 42, "regType": "DWord"}),
        ))
        .unwrap();
        assert_eq!(
            op,
            SystemOperation::SetRegistryValue(SetRegistryValue {
                path: "HKLM\\Software\\X".to_string(),
                name: "N".to_string(),
                value: "42".to_string(),
                kind: RegistryValueKind::Dword,
            })
        );

        let op = SystemOperation::from_entry(&entry(
            "set-registry-value",
            json!({"path": "HKLM\\Software\\X", "name": "N", "value": "", "regType": "binary"}),
        ))
        .unwrap();
        match op {
            SystemOperation::SetRegistryValue(reg) => {
                assert_eq!(reg.value, "");
                assert_eq!(reg.kind, RegistryValueKind::String);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_parse_manage_service_rejects_unknown_state() {
        let err = SystemOperation::from_entry(&entry(
            "manage-service",
            json!({"serviceName": "Spooler", "state": "paused"}),
        ))
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFieldValue { .. }));
    }

    #[test]
    fn test_parse_copy_file_overwrite_from_string() {
        let op = SystemOperation::from_entry(&entry(
            "copy-file",
            json!({"sourcePath": "a", "destinationPath": "b", "overwrite": "TRUE"}),
        ))
        .unwrap();
        match op {
            SystemOperation::CopyFile(copy) => assert!(copy.overwrite),
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_batch_result_counts() {
        let mut batch = BatchResult::started();
        batch.push(OperationResult::started("a", "copy-file").succeed(None));
        batch.push(OperationResult::started("b", "copy-file").fail("nope", None));
        let batch = batch.finish();
        assert_eq!(batch.total_operations, 2);
        assert_eq!(batch.successful_operations, 1);
        assert_eq!(batch.failed_operations, 1);
        assert_eq!(batch.results[0].operation_id, "a");
    }
}
