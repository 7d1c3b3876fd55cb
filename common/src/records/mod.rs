// Operation record models
// The file, registry and drive families share a header and a signature block.

pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub use store::OperationFileStore;

/// Fields attached to a record by the signer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(
        default,
        rename = "signerCertThumbprint",
        skip_serializing_if = "Option::is_none"
    )]
    pub signer_thumbprint: Option<String>,
    #[serde(default, rename = "hashAlgorithm", skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<String>,
    #[serde(
        default,
        rename = "signatureVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub signature_version: Option<String>,
}

impl SignatureBlock {
    /// Signed iff both the signature and the signer thumbprint are non-empty
    pub fn is_signed(&self) -> bool {
        let present = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.trim().is_empty());
        present(&self.signature) && present(&self.signer_thumbprint)
    }

    pub fn clear(&mut self) {
        *self = SignatureBlock::default();
    }
}

/// Identity, targeting and annotations shared by every record family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordHeader {
    pub id: String,
    pub targeting_type: String,
    pub target: String,
    #[serde(rename = "_comment1")]
    pub comment1: String,
    #[serde(rename = "_comment2")]
    pub comment2: String,
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self {
            id: String::new(),
            targeting_type: "none".to_string(),
            target: "all".to_string(),
            comment1: String::new(),
            comment2: String::new(),
        }
    }
}

impl RecordHeader {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// A record that can go through canonicalize / sign / validate.
///
/// Unknown members read from disk are kept in `extra` so they stay covered by the signature.
pub trait SignableRecord: Serialize + Clone + Send + Sync {
    fn header(&self) -> &RecordHeader;
    fn signature_block(&self) -> &SignatureBlock;
    fn signature_block_mut(&mut self) -> &mut SignatureBlock;
    fn display_name(&self) -> String;

    fn record_id(&self) -> &str {
        &self.header().id
    }

    fn is_signed(&self) -> bool {
        self.signature_block().is_signed()
    }
}

fn default_admin_context() -> String {
    "auto".to_string()
}

fn default_regtype() -> String {
    "string".to_string()
}

fn default_write_once() -> String {
    "false".to_string()
}

/// Entry of FILE-OPS.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOperation {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(default)]
    pub srcfilename: String,
    #[serde(default)]
    pub dstfilename: String,
    #[serde(default, rename = "sourcePath")]
    pub source_path: String,
    #[serde(default, rename = "destinationPath")]
    pub destination_path: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub copyonce: bool,
    #[serde(default, rename = "existCheckLocation")]
    pub exist_check_location: String,
    #[serde(default, rename = "existCheck")]
    pub exist_check: bool,
    #[serde(default, rename = "deleteFile")]
    pub delete_file: bool,
    #[serde(default, rename = "requiresAdmin")]
    pub requires_admin: bool,
    #[serde(default = "default_admin_context", rename = "adminContext")]
    pub admin_context: String,
    #[serde(flatten)]
    pub signature: SignatureBlock,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Entry of REG-OPS.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegOperation {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_regtype")]
    pub regtype: String,
    #[serde(default = "default_write_once")]
    pub write_once: String,
    #[serde(default)]
    pub delete: bool,
    #[serde(default, rename = "requiresAdmin")]
    pub requires_admin: bool,
    #[serde(default = "default_admin_context", rename = "adminContext")]
    pub admin_context: String,
    #[serde(flatten)]
    pub signature: SignatureBlock,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RegOperation {
    pub fn write_once(&self) -> bool {
        self.write_once.eq_ignore_ascii_case("true")
    }
}

/// Entry of DRIVE-OPS.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveOperation {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(default, rename = "driveLetter")]
    pub drive_letter: String,
    #[serde(default, rename = "drivePath")]
    pub drive_path: String,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(flatten)]
    pub signature: SignatureBlock,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! impl_signable_record {
    ($record:ty, |$this:ident| $display:expr) => {
        impl SignableRecord for $record {
            fn header(&self) -> &RecordHeader {
                &self.header
            }

            fn signature_block(&self) -> &SignatureBlock {
                &self.signature
            }

            fn signature_block_mut(&mut self) -> &mut SignatureBlock {
                &mut self.signature
            }

            fn display_name(&self) -> String {
                let $this = self;
                $display
            }
        }
    };
}

impl_signable_record!(FileOperation, |op| if op.delete_file {
    format!("[{}] Delete: {}", op.header.id, op.dstfilename)
} else {
    format!("[{}] {} → {}", op.header.id, op.srcfilename, op.dstfilename)
});

impl_signable_record!(RegOperation, |op| if op.delete {
    format!("[{}] Delete: {}\\{}", op.header.id, op.path, op.name)
} else {
    format!(
        "[{}] {}\\{} = {} ({})",
        op.header.id, op.path, op.name, op.value, op.regtype
    )
});

impl_signable_record!(DriveOperation, |op| if op.delete {
    format!("[{}] Delete: {}", op.header.id, op.drive_letter)
} else {
    format!("[{}] {} → {}", op.header.id, op.drive_letter, op.drive_path)
});

/// Record families, one JSON array file each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationFamily {
    File,
    Registry,
    Drive,
}

impl OperationFamily {
    pub const ALL: [OperationFamily; 3] = [
        OperationFamily::File,
        OperationFamily::Registry,
        OperationFamily::Drive,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            OperationFamily::File => "FILE-OPS.json",
            OperationFamily::Registry => "REG-OPS.json",
            OperationFamily::Drive => "DRIVE-OPS.json",
        }
    }

    /// Family of a well-known operation file name, ignoring case
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|family| family.file_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for OperationFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationFamily::File => f.write_str("File"),
            OperationFamily::Registry => f.write_str("Registry"),
            OperationFamily::Drive => f.write_str("Drive"),
        }
    }
}

/// Any record family behind a single type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OperationRecord {
    File(FileOperation),
    Registry(RegOperation),
    Drive(DriveOperation),
}

impl OperationRecord {
    pub fn family(&self) -> OperationFamily {
        match self {
            OperationRecord::File(_) => OperationFamily::File,
            OperationRecord::Registry(_) => OperationFamily::Registry,
            OperationRecord::Drive(_) => OperationFamily::Drive,
        }
    }

    /// Parse a JSON object as a record of `family`
    pub fn from_value(family: OperationFamily, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match family {
            OperationFamily::File => OperationRecord::File(serde_json::from_value(value)?),
            OperationFamily::Registry => OperationRecord::Registry(serde_json::from_value(value)?),
            OperationFamily::Drive => OperationRecord::Drive(serde_json::from_value(value)?),
        })
    }
}

impl SignableRecord for OperationRecord {
    fn header(&self) -> &RecordHeader {
        match self {
            OperationRecord::File(op) => op.header(),
            OperationRecord::Registry(op) => op.header(),
            OperationRecord::Drive(op) => op.header(),
        }
    }

    fn signature_block(&self) -> &SignatureBlock {
        match self {
            OperationRecord::File(op) => op.signature_block(),
            OperationRecord::Registry(op) => op.signature_block(),
            OperationRecord::Drive(op) => op.signature_block(),
        }
    }

    fn signature_block_mut(&mut self) -> &mut SignatureBlock {
        match self {
            OperationRecord::File(op) => op.signature_block_mut(),
            OperationRecord::Registry(op) => op.signature_block_mut(),
            OperationRecord::Drive(op) => op.signature_block_mut(),
        }
    }

    fn display_name(&self) -> String {
        match self {
            OperationRecord::File(op) => op.display_name(),
            OperationRecord::Registry(op) => op.display_name(),
            OperationRecord::Drive(op) => op.display_name(),
        }
    }
}
