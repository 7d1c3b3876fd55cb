// Record signer binary: sign and verify operation files out of band

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use common::config::{Settings, SigningSettings};
use common::records::{OperationFamily, OperationFileStore};
use common::signing::{
    signer_from_settings, Certificate, DirectoryCertificateStore, RecordSigner, StoreLocation,
    ValidationOutcome,
};
use common::telemetry;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "record-signer", about = "Sign and verify endpoint operation files")]
struct Cli {
    /// Directory holding default.toml / local.toml
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,
    /// Current-user certificate store directory
    #[arg(long, global = true, env = "AGENT__SIGNING__USER_STORE_DIR")]
    user_store: Option<PathBuf>,
    /// Machine certificate store directory
    #[arg(long, global = true, env = "AGENT__SIGNING__MACHINE_STORE_DIR")]
    machine_store: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List certificates usable for signing
    ListCerts,
    /// Sign every record of FILE-OPS.json, REG-OPS.json or DRIVE-OPS.json
    Sign {
        file: PathBuf,
        /// Signing certificate; optional when exactly one candidate exists
        #[arg(long)]
        thumbprint: Option<String>,
    },
    /// Validate the signature of every record in an operation file
    Verify { file: PathBuf },
    /// Create a self-issued code-signing certificate in a directory store
    Generate {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        store: PathBuf,
        #[arg(long, default_value_t = 365)]
        days: i64,
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging("warn", false)?;

    let mut signing = load_signing_settings(&cli.config_dir);
    merge_store_overrides(&mut signing, cli.user_store, cli.machine_store);
    let signer = signer_from_settings(&signing);

    match cli.command {
        Command::ListCerts => list_certificates(&signer),
        Command::Sign { file, thumbprint } => {
            let signed = sign_file(&file, thumbprint.as_deref(), &signer).await?;
            println!("Signed {} record(s) in {}", signed, file.display());
            Ok(())
        }
        Command::Verify { file } => {
            let invalid = verify_file(&file, &signer).await?;
            if invalid > 0 {
                bail!("{} record(s) failed signature validation", invalid);
            }
            Ok(())
        }
        Command::Generate {
            subject,
            store,
            days,
            bits,
        } => {
            let (certificate, path) = generate_certificate(&subject, &store, days, bits)?;
            println!("{}  {}", certificate.thumbprint(), path.display());
            Ok(())
        }
    }
}

/// Signing settings from `config_dir`, falling back to defaults when they cannot be loaded
fn load_signing_settings(config_dir: &Path) -> SigningSettings {
    match Settings::load_from_path(config_dir) {
        Ok(settings) => settings.signing,
        Err(e) => {
            warn!(config_dir = %config_dir.display(), error = %e, "Configuration unreadable, using default signing settings");
            SigningSettings::default()
        }
    }
}

fn merge_store_overrides(
    signing: &mut SigningSettings,
    user_store: Option<PathBuf>,
    machine_store: Option<PathBuf>,
) {
    if user_store.is_some() {
        signing.user_store_dir = user_store;
    }
    if machine_store.is_some() {
        signing.machine_store_dir = machine_store;
    }
}

fn list_certificates(signer: &RecordSigner) -> Result<()> {
    let certificates = signer.list_signing_certificates();
    if certificates.is_empty() {
        println!("No signing certificates found");
        return Ok(());
    }
    for cert in certificates {
        println!(
            "{}  {}  (expires {})",
            cert.thumbprint(),
            cert.subject(),
            cert.not_after().format("%Y-%m-%d")
        );
    }
    Ok(())
}

/// Store and family for an operation file path, keyed by its file name
fn open_family_file(file: &Path) -> Result<(OperationFileStore, OperationFamily)> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Not a file path: {}", file.display()))?;
    let family = OperationFamily::from_file_name(name).ok_or_else(|| {
        anyhow!(
            "Unrecognized operation file '{}'; expected one of {}",
            name,
            OperationFamily::ALL
                .iter()
                .map(|f| f.file_name())
                .collect::<Vec<_>>()
                .join(", ")
        )
    })?;
    let directory = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((OperationFileStore::new(directory), family))
}

fn choose_certificate(signer: &RecordSigner, thumbprint: Option<&str>) -> Result<Certificate> {
    if let Some(thumbprint) = thumbprint {
        return signer
            .find_certificate(thumbprint)
            .ok_or_else(|| anyhow!("Certificate {} not found in any store", thumbprint));
    }

    let mut candidates = signer.list_signing_certificates();
    match candidates.len() {
        0 => bail!("No signing certificates found; pass --thumbprint or generate one"),
        1 => Ok(candidates.remove(0)),
        n => bail!("{} signing certificates found; choose one with --thumbprint", n),
    }
}

async fn sign_file(file: &Path, thumbprint: Option<&str>, signer: &RecordSigner) -> Result<usize> {
    let (store, family) = open_family_file(file)?;
    let certificate = choose_certificate(signer, thumbprint)?;
    if !certificate.has_private_key() {
        bail!(
            "Certificate {} has no private key available for signing",
            certificate.thumbprint()
        );
    }

    let mut records = store
        .read_records(family)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    store
        .write_signed(family, &mut records, signer, &certificate)
        .await
        .with_context(|| format!("Failed to sign {}", file.display()))?;

    info!(file = %file.display(), records = records.len(), thumbprint = %certificate.thumbprint(), "Operation file signed");
    Ok(records.len())
}

/// Print one line per record; returns how many records are invalid
async fn verify_file(file: &Path, signer: &RecordSigner) -> Result<usize> {
    let (store, family) = open_family_file(file)?;
    let audits = store
        .audit(family, signer)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut invalid = 0;
    for audit in &audits {
        match &audit.outcome {
            ValidationOutcome::Valid {
                certificate,
                signed_at,
            } => println!(
                "VALID    {}  signed by {} at {}",
                audit.display_name,
                certificate.subject(),
                signed_at.as_deref().unwrap_or("unknown time")
            ),
            ValidationOutcome::Invalid(error) => {
                invalid += 1;
                println!("INVALID  {}  {}", audit.display_name, error);
            }
        }
    }
    println!(
        "{} record(s), {} valid, {} invalid",
        audits.len(),
        audits.len() - invalid,
        invalid
    );
    Ok(invalid)
}

fn generate_certificate(
    subject: &str,
    store: &Path,
    days: i64,
    bits: usize,
) -> Result<(Certificate, PathBuf)> {
    if days <= 0 {
        bail!("Validity must be at least one day");
    }
    let certificate = Certificate::generate(subject, chrono::Duration::days(days), bits)?;
    let path = DirectoryCertificateStore::new(StoreLocation::CurrentUser, store)
        .install(&certificate)?;
    Ok((certificate, path))
}
