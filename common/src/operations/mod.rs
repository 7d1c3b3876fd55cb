// System operations processor
// Reads the manifest, dispatches each entry to its handler in file order, aggregates results.

pub mod copy;
pub mod install;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod service;

use crate::config::OperationsSettings;
use crate::errors::{OperationError, ResolveError};
use crate::executor::process::CommandRunner;
use crate::models::{BatchResult, ManifestEntry, OperationResult, SystemOperation};
use crate::telemetry;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use copy::CopyFileHandler;
pub use install::InstallPackageHandler;
pub use registry::RegistryHandler;
pub use resolver::{ResolvedSource, SourceResolver};
pub use service::ServiceHandler;

/// OperationsProcessor applies a system operations manifest
#[async_trait]
pub trait OperationsProcessor: Send + Sync {
    /// Validate then execute every entry in order; an invalid manifest yields an empty batch
    async fn process_manifest(&self, manifest_path: &Path, cancel: &CancellationToken)
        -> BatchResult;

    async fn process_operation(
        &self,
        entry: &ManifestEntry,
        cancel: &CancellationToken,
    ) -> OperationResult;

    async fn validate_manifest(&self, manifest_path: &Path) -> bool;
}

/// Processor with one handler per operation type
pub struct SystemOperationsProcessor {
    secure_root: PathBuf,
    install: InstallPackageHandler,
    registry: RegistryHandler,
    service: ServiceHandler,
    copy: CopyFileHandler,
}

impl SystemOperationsProcessor {
    pub fn new(
        secure_root: impl Into<PathBuf>,
        settings: &OperationsSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ResolveError> {
        let resolver = Arc::new(SourceResolver::new(
            settings.cache_dir(),
            Duration::from_secs(settings.download_timeout_seconds),
        )?);

        Ok(Self {
            secure_root: secure_root.into(),
            install: InstallPackageHandler::new(
                runner.clone(),
                resolver.clone(),
                settings.installer.clone(),
                settings.default_install_arguments.clone(),
            ),
            registry: RegistryHandler::new(runner.clone(), settings.registry_tool.clone()),
            service: ServiceHandler::new(runner, settings.service_control.clone()),
            copy: CopyFileHandler::new(resolver),
        })
    }

    pub fn secure_root(&self) -> &Path {
        &self.secure_root
    }

    async fn dispatch(
        &self,
        operation: &SystemOperation,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, OperationError> {
        match operation {
            SystemOperation::InstallPackage(op) => self.install.execute(op, cancel).await,
            SystemOperation::SetRegistryValue(op) => self.registry.execute(op, cancel).await,
            SystemOperation::ManageService(op) => self.service.execute(op, cancel).await,
            SystemOperation::CopyFile(op) => self.copy.execute(op, cancel).await,
        }
    }
}

#[async_trait]
impl OperationsProcessor for SystemOperationsProcessor {
    #[tracing::instrument(skip(self, cancel), fields(manifest = %manifest_path.display()))]
    async fn process_manifest(
        &self,
        manifest_path: &Path,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let mut batch = BatchResult::started();

        let manifest = match manifest::load_manifest(manifest_path, &self.secure_root).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "Manifest failed validation; nothing executed");
                return batch.finish();
            }
        };

        info!(operations = manifest.operations.len(), "Processing system operations manifest");

        for entry in &manifest.operations {
            if cancel.is_cancelled() {
                batch.cancelled = true;
                info!(
                    completed = batch.total_operations,
                    remaining = manifest.operations.len() - batch.total_operations,
                    "Manifest processing cancelled"
                );
                break;
            }
            let result = self.process_operation(entry, cancel).await;
            batch.push(result);
        }
        if cancel.is_cancelled() {
            batch.cancelled = true;
        }

        let batch = batch.finish();
        info!(
            total = batch.total_operations,
            succeeded = batch.successful_operations,
            failed = batch.failed_operations,
            duration_ms = batch.duration().num_milliseconds(),
            "System operations processed"
        );
        batch
    }

    #[tracing::instrument(skip(self, entry, cancel), fields(operation_id = %entry.id, operation_type = %entry.operation_type))]
    async fn process_operation(
        &self,
        entry: &ManifestEntry,
        cancel: &CancellationToken,
    ) -> OperationResult {
        let mut result = OperationResult::started(&entry.id, &entry.operation_type);

        let operation = match SystemOperation::from_entry(entry) {
            Ok(operation) => operation,
            Err(e) => {
                warn!(error = %e, "Operation rejected");
                telemetry::record_operation(&entry.operation_type, false);
                return result.fail(e.to_string(), None);
            }
        };
        let operation_type = operation.operation_type();
        result.operation_type = operation_type.as_str().to_string();

        let outcome = AssertUnwindSafe(self.dispatch(&operation, cancel))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(output)) => {
                info!(operation_type = %operation_type, "Operation succeeded");
                result.succeed(output)
            }
            Ok(Err(e)) if e.is_cancelled() => {
                info!("Operation cancelled");
                result.fail(e.to_string(), None)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Operation failed");
                let output = match &e {
                    OperationError::CommandFailed { output, .. } => output.clone(),
                    _ => None,
                };
                result.fail(e.to_string(), output)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Operation handler panicked");
                result.fail(format!("Operation handler panicked: {}", message), None)
            }
        };

        telemetry::record_operation(operation_type.as_str(), result.success);
        result
    }

    async fn validate_manifest(&self, manifest_path: &Path) -> bool {
        match manifest::load_manifest(manifest_path, &self.secure_root).await {
            Ok(_) => true,
            Err(e) => {
                warn!(manifest = %manifest_path.display(), error = %e, "Manifest validation failed");
                false
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
