//! Object-store gateway over S3: transfers, deletion, presigned GET links,
//! and the presigned POST forms handed to uploaders.

use std::path::Path;
use std::time::Duration;

use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::AppError;

/// A presigned POST form: the upload URL plus the fields that must be
/// forwarded to the uploader verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct PresignedPost {
    pub url: String,
    pub fields: Vec<(String, String)>,
}

/// Policy inputs for a presigned POST, checked server-side on upload.
pub struct PostConditions<'a> {
    pub redirect_url: &'a str,
    pub acl: &'a str,
    pub encryption: &'a str,
    pub ttl_secs: u64,
}

#[derive(Clone)]
pub struct ObjectStorage {
    client: aws_sdk_s3::Client,
    credentials: SharedCredentialsProvider,
    region: String,
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::Storage(format!("{context}: {e}"))
}

/// Load the process AWS configuration pinned to the given region; shared by
/// the hot and cold storage gateways.
pub async fn aws_config_for(region: &str) -> aws_config::SdkConfig {
    aws_config::from_env()
        .region(aws_sdk_s3::config::Region::new(region.to_string()))
        .load()
        .await
}

impl ObjectStorage {
    pub fn new(cfg: &aws_config::SdkConfig, region: &str) -> Result<Self, AppError> {
        let credentials = cfg
            .credentials_provider()
            .cloned()
            .ok_or_else(|| AppError::Config("no AWS credentials provider".into()))?;
        Ok(Self {
            client: aws_sdk_s3::Client::new(cfg),
            credentials,
            region: region.to_string(),
        })
    }

    pub async fn download_to_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<(), AppError> {
        let bytes = self.get_bytes(bucket, key).await?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| storage_err("write downloaded object", e))
    }

    pub async fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>, AppError> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let svc = e.into_service_error();
                if svc.is_no_such_key() {
                    AppError::NotFound(format!("object {bucket}/{key}"))
                } else {
                    storage_err("get object", svc)
                }
            })?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| storage_err("read object body", e))?;
        Ok(data.into_bytes().to_vec())
    }

    pub async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<(), AppError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| storage_err("open upload file", e))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| storage_err("put object", e))?;
        Ok(())
    }

    pub async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        bucket: &str,
        key: &str,
    ) -> Result<(), AppError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| storage_err("put object", e))?;
        Ok(())
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), AppError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("delete object", e))?;
        Ok(())
    }

    /// Time-limited GET link for downloading an object.
    pub async fn presigned_get(
        &self,
        bucket: &str,
        key: &str,
        ttl_secs: u64,
    ) -> Result<String, AppError> {
        let req = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(
                PresigningConfig::builder()
                    .expires_in(Duration::from_secs(ttl_secs))
                    .build()
                    .map_err(|e| storage_err("presigning config", e))?,
            )
            .await
            .map_err(|e| storage_err("presign get", e))?;
        Ok(req.uri().to_string())
    }

    /// Browser-upload form for `key` (which may end in the `${filename}`
    /// placeholder). The signed policy pins the bucket, the key prefix, the
    /// ACL, the success redirect, and the encryption tag.
    pub async fn presigned_post(
        &self,
        bucket: &str,
        key: &str,
        conditions: &PostConditions<'_>,
    ) -> Result<PresignedPost, AppError> {
        let creds = self
            .credentials
            .provide_credentials()
            .await
            .map_err(|e| AppError::Config(format!("resolve AWS credentials: {e}")))?;
        build_presigned_post(&creds, &self.region, bucket, key, conditions, Utc::now())
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// SigV4 POST policy: a base64 policy document signed with the derived
/// service key, plus the form fields that mirror its conditions.
fn build_presigned_post(
    creds: &Credentials,
    region: &str,
    bucket: &str,
    key: &str,
    conditions: &PostConditions<'_>,
    now: DateTime<Utc>,
) -> Result<PresignedPost, AppError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let credential = format!(
        "{}/{date_stamp}/{region}/s3/aws4_request",
        creds.access_key_id()
    );
    let expiration = (now + chrono::Duration::seconds(conditions.ttl_secs as i64))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();

    // The uploader supplies the file name, so the key is matched on the
    // prefix in front of the placeholder.
    let key_prefix = key.trim_end_matches("${filename}");
    let mut policy_conditions = vec![
        json!({ "bucket": bucket }),
        json!(["starts-with", "$key", key_prefix]),
        json!({ "acl": conditions.acl }),
        json!({ "success_action_redirect": conditions.redirect_url }),
        json!({ "x-amz-server-side-encryption": conditions.encryption }),
        json!({ "x-amz-algorithm": "AWS4-HMAC-SHA256" }),
        json!({ "x-amz-credential": credential }),
        json!({ "x-amz-date": amz_date }),
    ];
    if let Some(token) = creds.session_token() {
        policy_conditions.push(json!({ "x-amz-security-token": token }));
    }

    let policy = json!({ "expiration": expiration, "conditions": policy_conditions });
    let policy_b64 = base64::encode(
        serde_json::to_vec(&policy).map_err(|e| AppError::Storage(format!("encode policy: {e}")))?,
    );

    let k_date = hmac_sha256::HMAC::mac(
        date_stamp.as_bytes(),
        format!("AWS4{}", creds.secret_access_key()).as_bytes(),
    );
    let k_region = hmac_sha256::HMAC::mac(region.as_bytes(), k_date);
    let k_service = hmac_sha256::HMAC::mac(b"s3", k_region);
    let k_signing = hmac_sha256::HMAC::mac(b"aws4_request", k_service);
    let signature = to_hex(&hmac_sha256::HMAC::mac(policy_b64.as_bytes(), k_signing));

    let mut fields = vec![
        ("key".to_string(), key.to_string()),
        ("acl".to_string(), conditions.acl.to_string()),
        (
            "success_action_redirect".to_string(),
            conditions.redirect_url.to_string(),
        ),
        (
            "x-amz-server-side-encryption".to_string(),
            conditions.encryption.to_string(),
        ),
        (
            "x-amz-algorithm".to_string(),
            "AWS4-HMAC-SHA256".to_string(),
        ),
        ("x-amz-credential".to_string(), credential),
        ("x-amz-date".to_string(), amz_date),
    ];
    if let Some(token) = creds.session_token() {
        fields.push(("x-amz-security-token".to_string(), token.to_string()));
    }
    fields.push(("policy".to_string(), policy_b64));
    fields.push(("x-amz-signature".to_string(), signature));

    Ok(PresignedPost {
        url: format!("https://{bucket}.s3.{region}.amazonaws.com"),
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_creds() -> Credentials {
        Credentials::new("AKIDEXAMPLE", "secret", None, None, "test")
    }

    fn form_field<'a>(post: &'a PresignedPost, name: &str) -> &'a str {
        post.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_else(|| panic!("missing field {name}"))
    }

    #[test]
    fn policy_pins_upload_conditions() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let key = "uploads/u1/abc123~${filename}";
        let post = build_presigned_post(
            &test_creds(),
            "us-east-1",
            "gas-inputs",
            key,
            &PostConditions {
                redirect_url: "https://gas.example.com/annotate/job",
                acl: "private",
                encryption: "AES256",
                ttl_secs: 60,
            },
            now,
        )
        .unwrap();

        assert_eq!(post.url, "https://gas-inputs.s3.us-east-1.amazonaws.com");
        assert_eq!(form_field(&post, "key"), key);
        assert_eq!(form_field(&post, "acl"), "private");

        let policy: serde_json::Value =
            serde_json::from_slice(&base64::decode(form_field(&post, "policy")).unwrap()).unwrap();
        assert_eq!(policy["expiration"], "2024-03-01T12:01:00Z");
        let conditions = policy["conditions"].as_array().unwrap();
        assert!(conditions.contains(&serde_json::json!({ "bucket": "gas-inputs" })));
        assert!(conditions.contains(&serde_json::json!([
            "starts-with",
            "$key",
            "uploads/u1/abc123~"
        ])));
        assert!(conditions.contains(&serde_json::json!({
            "success_action_redirect": "https://gas.example.com/annotate/job"
        })));
        assert!(
            conditions.contains(&serde_json::json!({ "x-amz-server-side-encryption": "AES256" }))
        );
    }

    #[test]
    fn signature_is_hex_of_sha256_width() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let post = build_presigned_post(
            &test_creds(),
            "us-east-1",
            "gas-inputs",
            "uploads/u1/abc123~${filename}",
            &PostConditions {
                redirect_url: "https://gas.example.com/annotate/job",
                acl: "private",
                encryption: "AES256",
                ttl_secs: 60,
            },
            now,
        )
        .unwrap();

        let sig = form_field(&post, "x-amz-signature");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(form_field(&post, "x-amz-credential")
            .starts_with("AKIDEXAMPLE/20240301/us-east-1/s3/"));
    }
}
