// Property-based tests for record canonicalization and signing

use chrono::Duration;
use common::errors::IntegrityError;
use common::records::{
    DriveOperation, FileOperation, OperationFamily, OperationRecord, RecordHeader,
    SignatureBlock,
};
use common::signing::{
    canonical_form, canonical_json, Certificate, MemoryCertificateStore, RecordSigner,
    StoreLocation,
};
use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::{json, Map, Value};
use std::sync::{Arc, OnceLock};

fn certificate() -> &'static Certificate {
    static CERT: OnceLock<Certificate> = OnceLock::new();
    CERT.get_or_init(|| Certificate::generate("CN=Property Tests", Duration::days(30), 1024).unwrap())
}

fn signer() -> RecordSigner {
    RecordSigner::new(vec![Arc::new(MemoryCertificateStore::with_certificates(
        StoreLocation::LocalMachine,
        vec![certificate().clone()],
    ))])
}

fn file_operation(id: &str, src: &str, dst: &str, overwrite: bool) -> FileOperation {
    FileOperation {
        header: RecordHeader::new(id),
        srcfilename: src.to_string(),
        dstfilename: dst.to_string(),
        source_path: "\\\\fileserver\\share".to_string(),
        destination_path: "C:\\Users\\Public".to_string(),
        overwrite,
        copyonce: false,
        exist_check_location: String::new(),
        exist_check: false,
        delete_file: false,
        requires_admin: false,
        admin_context: String::new(),
        signature: SignatureBlock::default(),
        extra: Map::new(),
    }
}

/// Fully populated on-disk record of `family`; `text` and `flags` vary the field values
fn record_value(family: OperationFamily, id: &str, text: &str, flags: &[bool]) -> Value {
    let mut value = json!({
        "id": id,
        "targeting_type": "group",
        "target": format!("{}-ring", text),
        "_comment1": format!("first {}", text),
        "_comment2": format!("second {}", text),
    });
    let fields = match family {
        OperationFamily::File => json!({
            "srcfilename": format!("{}.cfg", text),
            "dstfilename": format!("{}.bak", text),
            "sourcePath": format!("\\\\fileserver\\{}", text),
            "destinationPath": "C:\\ProgramData\\Contoso",
            "overwrite": flags[0],
            "copyonce": flags[1],
            "existCheckLocation": format!("C:\\Temp\\{}", text),
            "existCheck": flags[2],
            "deleteFile": flags[3],
            "requiresAdmin": flags[4],
            "adminContext": "auto"
        }),
        OperationFamily::Registry => json!({
            "name": text,
            "path": format!("HKCU:\\Software\\{}", text),
            "value": format!("{}-value", text),
            "regtype": "dword",
            "write_once": "false",
            "delete": flags[0],
            "requiresAdmin": flags[1],
            "adminContext": "user"
        }),
        OperationFamily::Drive => json!({
            "driveLetter": "P:",
            "drivePath": format!("\\\\srv\\{}", text),
            "reconnect": flags[0],
            "delete": flags[1],
            "hidden": flags[2]
        }),
    };
    if let (Value::Object(target), Value::Object(extra)) = (&mut value, fields) {
        target.extend(extra);
    }
    value
}

/// Change one JSON member so it can no longer equal its previous value
fn mutate(value: &mut Value) {
    let replacement = match &*value {
        Value::Bool(b) => Value::Bool(!b),
        Value::String(s) => Value::String(format!("{}-x", s)),
        other => json!([other]),
    };
    *value = replacement;
}

fn family_strategy() -> impl Strategy<Value = OperationFamily> {
    prop::sample::select(OperationFamily::ALL.to_vec())
}

/// Rebuild a JSON object with its keys inserted in reverse order
fn reverse_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut reversed = Map::new();
            for (k, v) in map.iter().rev() {
                reversed.insert(k.clone(), reverse_keys(v));
            }
            Value::Object(reversed)
        }
        Value::Array(items) => Value::Array(items.iter().map(reverse_keys).collect()),
        other => other.clone(),
    }
}

/// *For any* record of any family, the canonical form does not depend on the order its fields were written in.
#[test]
fn property_canonical_form_ignores_field_order() {
    proptest!(|(
        family in family_strategy(),
        id in "[0-9]{1,4}",
        text in "[A-Za-z0-9_.-]{1,24}",
        flags in prop::collection::vec(any::<bool>(), 5)
    )| {
        let value = record_value(family, &id, &text, &flags);
        let record = OperationRecord::from_value(family, value.clone()).unwrap();
        let reordered = OperationRecord::from_value(family, reverse_keys(&value)).unwrap();

        prop_assert_eq!(reordered.family(), family);
        prop_assert_eq!(canonical_form(&record).unwrap(), canonical_form(&reordered).unwrap());
        prop_assert_eq!(canonical_json(&value), canonical_json(&reverse_keys(&value)));
    });
}

/// *For any* signed record of any family, changing any single signed field breaks validation.
#[test]
fn property_signed_record_detects_tampering() {
    let signer = signer();
    let mut config = ProptestConfig::with_cases(48);
    config.failure_persistence = None;

    proptest!(config, |(
        family in family_strategy(),
        id in "[0-9]{1,4}",
        text in "[A-Za-z0-9_.-]{1,24}",
        flags in prop::collection::vec(any::<bool>(), 5),
        field in any::<Index>()
    )| {
        let value = record_value(family, &id, &text, &flags);
        let signed_keys: Vec<String> = value.as_object().unwrap().keys().cloned().collect();

        let mut record = OperationRecord::from_value(family, value).unwrap();
        prop_assert!(signer.sign(&mut record, certificate()));
        prop_assert!(signer.validate(&record).is_valid());

        // Round-tripping through the on-disk shape keeps the signature valid
        let body = serde_json::to_string_pretty(&record).unwrap();
        let mut on_disk: Value = serde_json::from_str(&body).unwrap();
        let reloaded = OperationRecord::from_value(family, on_disk.clone()).unwrap();
        prop_assert!(signer.validate(&reloaded).is_valid());

        let key = field.get(&signed_keys);
        mutate(on_disk.get_mut(key.as_str()).unwrap());
        let tampered = OperationRecord::from_value(family, on_disk).unwrap();
        let outcome = signer.validate(&tampered);
        prop_assert!(!outcome.is_valid(), "editing {} went unnoticed", key);
        prop_assert!(
            matches!(outcome.error(), Some(IntegrityError::SignatureMismatch)),
            "editing {} gave {:?}", key, outcome.error()
        );
    });
}

#[test]
fn test_unsigned_record_is_rejected() {
    let record = file_operation("1", "a.txt", "b.txt", false);
    let outcome = signer().validate(&record);
    assert!(matches!(outcome.error(), Some(IntegrityError::NotSigned)));
}

#[test]
fn test_unknown_fields_are_covered_by_signature() {
    let signer = signer();
    let value = json!({
        "id": "7",
        "driveLetter": "M:",
        "drivePath": "\\\\srv\\maps",
        "reconnect": true,
        "delete": false,
        "hidden": false,
        "customFlag": "keep-me"
    });

    let mut record = match OperationRecord::from_value(OperationFamily::Drive, value).unwrap() {
        OperationRecord::Drive(drive) => drive,
        other => panic!("unexpected record family: {:?}", other.family()),
    };
    assert!(signer.sign(&mut record, certificate()));

    let mut edited: DriveOperation = record.clone();
    edited
        .extra
        .insert("customFlag".to_string(), Value::String("changed".to_string()));
    assert!(signer.validate(&record).is_valid());
    assert!(!signer.validate(&edited).is_valid());
}

#[test]
fn test_signature_from_unknown_certificate_is_rejected() {
    let mut record = file_operation("3", "a.txt", "b.txt", true);
    assert!(signer().sign(&mut record, certificate()));

    let empty = RecordSigner::new(vec![Arc::new(MemoryCertificateStore::new(
        StoreLocation::CurrentUser,
    ))]);
    let outcome = empty.validate(&record);
    assert!(matches!(outcome.error(), Some(IntegrityError::CertificateNotFound(_))));
}
