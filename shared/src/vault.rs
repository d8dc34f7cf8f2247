//! Cold-storage gateway: vault archives with asynchronous, tiered retrieval.

use aws_sdk_glacier::primitives::ByteStream;
use aws_sdk_glacier::types::JobParameters;
use strum_macros::{Display, EnumString};

use crate::error::AppError;

/// Retrieval latency tier. `Expedited` is minutes but capacity-limited;
/// `Standard` is hours but always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum RetrievalTier {
    Expedited,
    Standard,
}

#[derive(Clone)]
pub struct ColdVault {
    client: aws_sdk_glacier::Client,
    vault: String,
}

impl ColdVault {
    pub fn new(cfg: &aws_config::SdkConfig, vault: &str) -> Self {
        Self {
            client: aws_sdk_glacier::Client::new(cfg),
            vault: vault.to_string(),
        }
    }

    /// Upload bytes into the vault and return the archive handle.
    pub async fn upload_archive(&self, bytes: Vec<u8>) -> Result<String, AppError> {
        let out = self
            .client
            .upload_archive()
            .account_id("-")
            .vault_name(&self.vault)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("upload archive: {e}")))?;
        out.archive_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::Storage("upload accepted without archive id".into()))
    }

    /// Start an archive retrieval. The completion is announced on
    /// `notify_topic` with `description` echoed back for routing, so callers
    /// pass the application job id there.
    ///
    /// An exhausted `Expedited` tier surfaces as [`AppError::Capacity`] so the
    /// caller can retry on `Standard`.
    pub async fn initiate_retrieval(
        &self,
        archive_id: &str,
        tier: RetrievalTier,
        notify_topic: &str,
        description: &str,
    ) -> Result<String, AppError> {
        let params = JobParameters::builder()
            .r#type("archive-retrieval")
            .archive_id(archive_id)
            .description(description)
            .sns_topic(notify_topic)
            .tier(tier.to_string())
            .build();
        let out = self
            .client
            .initiate_job()
            .account_id("-")
            .vault_name(&self.vault)
            .job_parameters(params)
            .send()
            .await
            .map_err(|e| {
                let svc = e.into_service_error();
                if svc.is_insufficient_capacity_exception() {
                    AppError::Capacity(format!("{tier} retrieval: {svc}"))
                } else {
                    AppError::Storage(format!("initiate retrieval: {svc}"))
                }
            })?;
        out.job_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::Storage("retrieval accepted without job id".into()))
    }

    /// Fetch the output of a completed retrieval job.
    pub async fn retrieval_bytes(&self, retrieval_job_id: &str) -> Result<Vec<u8>, AppError> {
        let out = self
            .client
            .get_job_output()
            .account_id("-")
            .vault_name(&self.vault)
            .job_id(retrieval_job_id)
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("get retrieval output: {e}")))?;
        let data = out
            .body
            .collect()
            .await
            .map_err(|e| AppError::Storage(format!("read retrieval output: {e}")))?;
        Ok(data.into_bytes().to_vec())
    }

    /// Delete an archive. A missing archive is treated as already deleted so
    /// redelivered restore events stay idempotent.
    pub async fn delete_archive(&self, archive_id: &str) -> Result<(), AppError> {
        match self
            .client
            .delete_archive()
            .account_id("-")
            .vault_name(&self.vault)
            .archive_id(archive_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let svc = e.into_service_error();
                if svc.is_resource_not_found_exception() {
                    Ok(())
                } else {
                    Err(AppError::Storage(format!("delete archive: {svc}")))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_render_their_wire_names() {
        assert_eq!(RetrievalTier::Expedited.to_string(), "Expedited");
        assert_eq!(
            "Standard".parse::<RetrievalTier>().unwrap(),
            RetrievalTier::Standard
        );
    }
}
