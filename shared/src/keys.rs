//! Object-key layout for the inputs and results buckets.
//!
//! Inputs use `<prefix>/<user_id>/<job_id>~<filename>`; the first `~` is the
//! boundary between the minted job id and the original file name. Results use
//! `<tenant>/<user_id>/<job_id>/<filename>`.

use uuid::Uuid;

use crate::error::AppError;

/// Components of an inputs-bucket key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputKey {
    pub user_id: String,
    pub job_id: String,
    pub filename: String,
}

/// Mint a fresh job id: a 128-bit random identifier rendered as hex.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Upload key handed to the presigned POST. `${filename}` is a placeholder
/// the object store substitutes with the uploaded file name.
pub fn upload_key(prefix: &str, user_id: &str, job_id: &str) -> String {
    format!("{prefix}/{user_id}/{job_id}~${{filename}}")
}

/// Split an inputs key into its components. Only the first `~` separates the
/// job id from the file name; any later ones belong to the file name.
pub fn parse_input_key(key: &str) -> Result<InputKey, AppError> {
    let mut parts = key.splitn(3, '/');
    let prefix = parts.next().unwrap_or_default();
    let user_id = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();
    if prefix.is_empty() || user_id.is_empty() {
        return Err(AppError::Schema(format!("malformed input key: {key}")));
    }
    let (job_id, filename) = rest
        .split_once('~')
        .ok_or_else(|| AppError::Schema(format!("no job id separator in key: {key}")))?;
    if job_id.is_empty() || filename.is_empty() {
        return Err(AppError::Schema(format!("malformed input key: {key}")));
    }
    Ok(InputKey {
        user_id: user_id.to_string(),
        job_id: job_id.to_string(),
        filename: filename.to_string(),
    })
}

/// Results-bucket key for one artifact of a job.
pub fn result_key(tenant: &str, user_id: &str, job_id: &str, file: &str) -> String {
    format!("{tenant}/{user_id}/{job_id}/{file}")
}

pub fn is_result_file(name: &str) -> bool {
    name.ends_with(".annot.vcf")
}

pub fn is_log_file(name: &str) -> bool {
    name.ends_with(".log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minted_key() {
        let job_id = new_job_id();
        let key = upload_key("uploads", "u1", &job_id).replace("${filename}", "sample.vcf");
        let parsed = parse_input_key(&key).unwrap();
        assert_eq!(parsed.user_id, "u1");
        assert_eq!(parsed.job_id, job_id);
        assert_eq!(parsed.filename, "sample.vcf");
    }

    #[test]
    fn only_first_tilde_separates() {
        let parsed = parse_input_key("uploads/u1/abc123~weird~name.vcf").unwrap();
        assert_eq!(parsed.job_id, "abc123");
        assert_eq!(parsed.filename, "weird~name.vcf");
    }

    #[test]
    fn rejects_keys_without_separator() {
        assert!(parse_input_key("uploads/u1/no-separator.vcf").is_err());
        assert!(parse_input_key("uploads").is_err());
        assert!(parse_input_key("uploads/u1/~name.vcf").is_err());
    }

    #[test]
    fn result_key_layout() {
        let key = result_key("acme", "u1", "j1", "sample.annot.vcf");
        assert_eq!(key, "acme/u1/j1/sample.annot.vcf");
        assert!(key.contains("/j1/"));
        assert!(is_result_file(&key));
        assert!(!is_log_file(&key));
        assert!(is_log_file("sample.vcf.count.log"));
    }
}
