// Script safety gate: allow-list, secure-root containment, deny-list content scan

use crate::errors::{ScriptRejection, ValidationError};
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Automation scripts the agent is permitted to run, relative to the secure root
pub const DEFAULT_ALLOWED_SCRIPTS: &[&str] = &[
    "MAIN.PS1",
    "MGMT-FileOps.ps1",
    "MGMT-RegOps.ps1",
    "MGMT-DriveOps.ps1",
    "MGMT-RoamOps.ps1",
    "MGMT-SchedTsk.ps1",
    "MGMT-Telemetry.ps1",
    "MGMT-USER-CUSTOM.ps1",
    "MGMT-Maint.ps1",
];

/// Remote fetch-and-execute idioms; matched case-insensitively against script content
pub const DEFAULT_DENIED_PATTERNS: &[&str] = &[
    r"Invoke-Expression",
    r"\bIEX\b",
    r"DownloadString",
    r"DownloadFile",
    r"Net\.WebClient",
    r"Invoke-RestMethod",
    r"Invoke-WebRequest",
    r"Start-Process.*\bcmd\b",
    r"\bcmd(\.exe)?\b.*\s/c\b",
    r"\b(powershell|pwsh)(\.exe)?\b.*\s-(e|ec|enc|encodedcommand)\b",
    r"FromBase64String",
];

/// Immutable safety policy injected into the script executor
#[derive(Debug, Clone)]
pub struct ScriptSafetyPolicy {
    secure_root: PathBuf,
    allowed_scripts: Vec<PathBuf>,
    denied_patterns: Vec<Regex>,
}

impl ScriptSafetyPolicy {
    /// Build a policy; allow-list names are resolved against `secure_root`
    pub fn new<I, S, P, T>(
        secure_root: impl Into<PathBuf>,
        allowed_scripts: I,
        denied_patterns: P,
    ) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        P: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let secure_root = secure_root.into();
        let allowed_scripts = allowed_scripts
            .into_iter()
            .map(|name| secure_root.join(name.as_ref()))
            .collect();

        let denied_patterns = denied_patterns
            .into_iter()
            .map(|pattern| {
                RegexBuilder::new(pattern.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ValidationError::InvalidFieldValue {
                        field: "denied_patterns".to_string(),
                        reason: format!("'{}': {}", pattern.as_ref(), e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            secure_root,
            allowed_scripts,
            denied_patterns,
        })
    }

    /// Policy with the built-in allow-list and deny-list
    pub fn with_defaults(secure_root: impl Into<PathBuf>) -> Result<Self, ValidationError> {
        Self::new(secure_root, DEFAULT_ALLOWED_SCRIPTS, DEFAULT_DENIED_PATTERNS)
    }

    pub fn secure_root(&self) -> &Path {
        &self.secure_root
    }

    pub fn is_allow_listed(&self, script_path: &Path) -> bool {
        let candidate = script_path.to_string_lossy();
        self.allowed_scripts
            .iter()
            .any(|allowed| allowed.to_string_lossy().eq_ignore_ascii_case(&candidate))
    }

    /// First deny-list pattern found in `content`, if any
    pub fn denied_pattern_in(&self, content: &str) -> Option<&str> {
        self.denied_patterns
            .iter()
            .find(|pattern| pattern.is_match(content))
            .map(|pattern| pattern.as_str())
    }

    /// Run every check in order; the first failure wins
    pub async fn check(&self, script_path: &Path) -> Result<(), ScriptRejection> {
        let display = script_path.display().to_string();

        if !self.is_allow_listed(script_path) {
            return Err(ScriptRejection::NotAllowListed(display));
        }

        let resolved = match tokio::fs::canonicalize(script_path).await {
            Ok(resolved) => resolved,
            Err(_) => return Err(ScriptRejection::NotFound(display)),
        };
        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(ScriptRejection::NotFound(display)),
        }

        if !is_within(&resolved, &self.secure_root).await {
            return Err(ScriptRejection::OutsideSecureRoot(display));
        }

        let content = tokio::fs::read(&resolved)
            .await
            .map_err(|e| ScriptRejection::Unreadable(format!("{}: {}", display, e)))?;
        let content = String::from_utf8_lossy(&content);

        if let Some(pattern) = self.denied_pattern_in(&content) {
            return Err(ScriptRejection::DeniedPattern {
                path: display,
                pattern: pattern.to_string(),
            });
        }

        Ok(())
    }

    /// Boolean form of [`check`](Self::check) that logs the rejection reason
    pub async fn validate(&self, script_path: &Path) -> bool {
        match self.check(script_path).await {
            Ok(()) => true,
            Err(rejection) => {
                warn!(script = %script_path.display(), reason = %rejection, "Script failed security validation");
                false
            }
        }
    }
}

/// Whether the fully resolved `path` lives in `root` or one of its subdirectories.
///
/// Both sides are canonicalized so `..` segments and symlinks cannot escape;
/// the comparison is per path component, not a string prefix.
pub async fn is_within(path: &Path, root: &Path) -> bool {
    let Ok(resolved_root) = tokio::fs::canonicalize(root).await else {
        return false;
    };
    let Ok(resolved) = tokio::fs::canonicalize(path).await else {
        return false;
    };
    match resolved.parent() {
        Some(parent) => parent.starts_with(&resolved_root),
        None => false,
    }
}
