use aws_sdk_s3 as s3;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::ServerSideEncryption;
use std::path::Path;
use tracing::info;

use crate::config::{S3Encryption, SpacesConfig};
use crate::errors::{BackupError, Result};

/// Object key of an uploaded archive: `<folder_prefix>/<file name>`.
pub fn object_key(spaces_config: &SpacesConfig, file_name: &str) -> String {
    match spaces_config.folder_prefix.as_deref().map(|p| p.trim_matches('/')) {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, file_name),
        _ => file_name.to_string(),
    }
}

/// Uploads a backup archive to an S3-compatible object storage service.
pub async fn upload_file_to_s3(spaces_config: &SpacesConfig, file_path: &Path, s3_key: &str) -> Result<()> {
    info!(
        "Uploading {} to bucket {} as {}",
        file_path.display(),
        spaces_config.bucket_name,
        s3_key
    );

    let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
        .endpoint_url(&spaces_config.endpoint_url)
        .region(Region::new(spaces_config.region.clone()))
        .credentials_provider(s3::config::Credentials::new(
            &spaces_config.access_key_id,
            &spaces_config.secret_access_key,
            None,
            None,
            "Static",
        ))
        .load()
        .await;

    let client = s3::Client::new(&sdk_config);

    let body = ByteStream::from_path(file_path).await.map_err(|e| {
        BackupError::Storage(format!("Failed to read {}: {}", file_path.display(), e))
    })?;

    let mut request = client
        .put_object()
        .bucket(&spaces_config.bucket_name)
        .key(s3_key)
        .body(body);
    match &spaces_config.encryption {
        Some(S3Encryption::Managed { algorithm, kms_key_id }) => {
            request = request
                .server_side_encryption(ServerSideEncryption::from(algorithm.as_str()))
                .set_ssekms_key_id(kms_key_id.clone());
        }
        Some(S3Encryption::CustomerKey { algorithm, key }) => {
            let (key, key_md5) = customer_key_headers(key);
            request = request
                .sse_customer_algorithm(algorithm)
                .sse_customer_key(key)
                .sse_customer_key_md5(key_md5);
        }
        None => {}
    }

    request
        .send()
        .await
        .map_err(|e| {
            BackupError::Storage(format!(
                "Failed to upload {} to bucket {} with key {}: {}",
                file_path.display(),
                spaces_config.bucket_name,
                s3_key,
                e
            ))
        })?;

    Ok(())
}

/// ` (encrypted with <algorithm>)` for the upload log line, empty without encryption.
pub fn encryption_note(spaces_config: &SpacesConfig) -> String {
    spaces_config
        .encryption
        .as_ref()
        .map(|e| format!(" (encrypted with {})", e.algorithm()))
        .unwrap_or_default()
}

/// SSE-C wants the raw key and its MD5, both base64.
fn customer_key_headers(key: &str) -> (String, String) {
    (STANDARD.encode(key), STANDARD.encode(Md5::digest(key.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spaces(prefix: Option<&str>) -> SpacesConfig {
        SpacesConfig {
            endpoint_url: "https://s3.example.com".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "id".to_string(),
            secret_access_key: "secret".to_string(),
            bucket_name: "backups".to_string(),
            folder_prefix: prefix.map(str::to_string),
            encryption: None,
        }
    }

    #[test]
    fn test_object_key_uses_folder_prefix() {
        assert_eq!(object_key(&spaces(None), "1_gitlab_backup.tar"), "1_gitlab_backup.tar");
        assert_eq!(object_key(&spaces(Some("gitlab/")), "1_gitlab_backup.tar"), "gitlab/1_gitlab_backup.tar");
        assert_eq!(object_key(&spaces(Some("/")), "1_gitlab_backup.tar"), "1_gitlab_backup.tar");
    }

    #[test]
    fn test_encryption_note_names_the_algorithm() {
        let mut config = spaces(None);
        assert_eq!(encryption_note(&config), "");

        config.encryption = Some(S3Encryption::Managed {
            algorithm: "aws:kms".to_string(),
            kms_key_id: Some("arn:aws:kms:12345".to_string()),
        });
        assert_eq!(encryption_note(&config), " (encrypted with aws:kms)");

        config.encryption = Some(S3Encryption::CustomerKey {
            algorithm: "AES256".to_string(),
            key: "0123456789abcdef0123456789abcdef".to_string(),
        });
        assert_eq!(encryption_note(&config), " (encrypted with AES256)");
    }

    #[test]
    fn test_customer_key_headers_are_base64() {
        let (key, key_md5) = customer_key_headers("0123456789abcdef0123456789abcdef");
        assert_eq!(STANDARD.decode(&key).unwrap(), b"0123456789abcdef0123456789abcdef");
        assert_eq!(
            hex::encode(STANDARD.decode(&key_md5).unwrap()),
            "8516ac99dc60603295de7bdb6a153530"
        );
    }
}
