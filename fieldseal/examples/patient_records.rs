//! Auto-encrypting patient records with a file-backed key vault.

use base64::{engine::general_purpose::STANDARD, Engine};
use fieldseal::config::LocalProviderConfig;
use fieldseal::key_manager::EnvelopeKeyManager;
use fieldseal::prelude::*;
use fieldseal_key_file::JsonFileKeyVault;
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("fieldseal Patient Records Example");
    println!("=================================\n");

    // In production the master key comes from a secret store.
    let master_key = [0x42u8; 96];
    let vault_path = std::env::temp_dir().join("fieldseal_example_keyvault.json");

    // Create a data key once; its id goes into the schema.
    let vault = Arc::new(JsonFileKeyVault::open(&vault_path)?);
    let local = LocalKeyProvider::from_config(&LocalProviderConfig::from_bytes(&master_key))?;
    let keys = EnvelopeKeyManager::new(vault).with_provider(Arc::new(local));
    let key_id = keys.create_data_key(MasterKey::Local).await?;
    println!("✓ Data key {key_id} stored in {}\n", vault_path.display());

    let options = EncryptionOptions::from_json_str(
        &json!({
            "kmsProviders": [{ "provider": "local", "key": STANDARD.encode(master_key) }],
            "schemaMap": {
                "medical.patients": {
                    "bsonType": "object",
                    "encryptMetadata": { "keyId": [{ "$uuid": key_id.to_string() }] },
                    "properties": {
                        "ssn": { "encrypt": { "bsonType": "int", "algorithm": "Deterministic" } },
                        "bloodType": { "encrypt": { "bsonType": "string", "algorithm": "Random" } },
                        "medicalRecords": { "encrypt": { "bsonType": "array", "algorithm": "Random" } }
                    }
                }
            }
        })
        .to_string(),
    )?;

    let encrypter = AutoEncrypter::from_options(
        &options,
        Arc::new(JsonFileKeyVault::open(&vault_path)?),
        [],
    )?;

    let patient = Document::try_from(json!({
        "name": "Jon Doe",
        "ssn": 241014209,
        "bloodType": "AB+",
        "medicalRecords": [{ "weight": 180 }]
    }))?;

    let stored = encrypter.encrypt_for_write("medical.patients", &patient).await?;
    for (field, value) in stored.iter() {
        if let Some(blob) = value.as_encrypted() {
            println!("  {field}: <encrypted, {} bytes>", blob.len());
        } else {
            println!("  {field}: {value:?}");
        }
    }
    println!("✓ Document encrypted for write\n");

    // The same ssn always encrypts to the same bytes, so it can be queried.
    let again = encrypter.encrypt_for_write("medical.patients", &patient).await?;
    assert_eq!(stored.get("ssn"), again.get("ssn"));
    assert_ne!(stored.get("bloodType"), again.get("bloodType"));
    println!("✓ Deterministic ssn is stable, random bloodType is not\n");

    let restored = encrypter.decrypt_for_read(&stored).await?;
    assert_eq!(restored, patient);
    println!("✓ Round-trip verification successful\n");

    println!("=================================");
    println!("Note: key vault at {} can be deleted manually", vault_path.display());

    Ok(())
}
