//! Job execution: download the input, supervise the pipeline subprocess,
//! upload the artifacts, and advance the job record.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rdkafka::producer::FutureProducer;
use tokio::process::Command;
use tracing::{error, info, warn};

use shared::config::Settings;
use shared::db::JobStore;
use shared::dto::{ArchiveScheduled, JobCompleted, JobStatus, JobSubmitted};
use shared::error::AppError;
use shared::storage::ObjectStorage;
use shared::{kafka, keys};

/// What to do with the source message after a handling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Post-condition is observable in the store (or the message is poison
    /// or a duplicate): acknowledge.
    Ack,
    /// Transient failure; leave the message unacknowledged so it is
    /// redelivered.
    Retry,
}

pub struct Annotator {
    pub store: JobStore,
    pub storage: ObjectStorage,
    pub producer: FutureProducer,
    pub settings: Settings,
}

impl Annotator {
    /// Common handler behind both front-ends (poll loop and webhook).
    pub async fn handle_payload(&self, payload: &str) -> Disposition {
        let job = match kafka::unwrap_message::<JobSubmitted>(payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(%e, "dropping poison job request");
                return Disposition::Ack;
            }
        };

        match self.run_job(&job).await {
            Ok(()) => Disposition::Ack,
            Err(AppError::Conflict(reason)) => {
                // A peer won the PENDING -> RUNNING race; this delivery is a
                // duplicate and carries no further work.
                info!(job_id = %job.job_id, %reason, "job already claimed");
                Disposition::Ack
            }
            Err(e) => {
                error!(job_id = %job.job_id, %e, "job handling failed");
                Disposition::Retry
            }
        }
    }

    async fn run_job(&self, job: &JobSubmitted) -> Result<(), AppError> {
        // Claim the job before touching anything else: exactly one delivery
        // wins the CAS, so a duplicate never spawns a second pipeline and
        // never sees the winner's working directory.
        self.store
            .set_status_if(&job.job_id, JobStatus::Pending, JobStatus::Running)
            .await?;

        let workdir = PathBuf::from(&self.settings.annotator_workdir).join(&job.job_id);
        let mut child = match self.stage_input_and_spawn(job, &workdir).await {
            Ok(child) => child,
            Err(e) => {
                // The claim is held but no pipeline is running; hand the job
                // back so a redelivery can retry from PENDING.
                remove_workdir(&workdir).await;
                self.release_claim(&job.job_id).await;
                return Err(e);
            }
        };

        let started = std::time::Instant::now();
        let status = child
            .wait()
            .await
            .map_err(|e| AppError::Transport(format!("wait for pipeline: {e}")))?;
        if !status.success() {
            warn!(job_id = %job.job_id, code = ?status.code(), "pipeline exited with failure");
            self.store.mark_failed(&job.job_id).await?;
            remove_workdir(&workdir).await;
            return Ok(());
        }
        info!(
            job_id = %job.job_id,
            runtime_secs = started.elapsed().as_secs_f64(),
            "pipeline finished"
        );

        self.finalize(job, &workdir).await
    }

    /// Prepare the private working directory, download the input into it,
    /// and start the pipeline subprocess.
    async fn stage_input_and_spawn(
        &self,
        job: &JobSubmitted,
        workdir: &Path,
    ) -> Result<tokio::process::Child, AppError> {
        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(|e| AppError::Storage(format!("create working directory: {e}")))?;

        let input_path = workdir.join(&job.input_file_name);
        self.storage
            .download_to_file(&job.input_bucket, &job.input_key, &input_path)
            .await?;

        Command::new(&self.settings.pipeline_command)
            .arg(&input_path)
            .arg(&job.job_id)
            .arg(&job.user_id)
            .spawn()
            .map_err(|e| AppError::Transport(format!("spawn pipeline: {e}")))
    }

    /// Give a claimed job back to the queue after a failure that happened
    /// before the pipeline started.
    async fn release_claim(&self, job_id: &str) {
        if let Err(e) = self
            .store
            .set_status_if(job_id, JobStatus::Running, JobStatus::Pending)
            .await
        {
            warn!(%job_id, %e, "failed to release claimed job");
        }
    }

    /// Upload every artifact except the original input, flip the record to
    /// COMPLETED, publish the result event, and schedule archival.
    async fn finalize(&self, job: &JobSubmitted, workdir: &Path) -> Result<(), AppError> {
        let artifacts = collect_artifacts(workdir, &job.input_file_name)
            .map_err(|e| AppError::Storage(format!("scan working directory: {e}")))?;

        let mut result_key = None;
        let mut log_key = None;
        for path in &artifacts {
            let file = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| AppError::Storage(format!("unreadable artifact name: {path:?}")))?;
            let key = keys::result_key(&self.settings.tenant_prefix, &job.user_id, &job.job_id, file);
            self.storage
                .upload_file(path, &self.settings.results_bucket, &key)
                .await?;
            if keys::is_result_file(file) {
                result_key = Some(key);
            } else if keys::is_log_file(file) {
                log_key = Some(key);
            }
        }

        let (Some(result_key), Some(log_key)) = (result_key, log_key) else {
            // The pipeline ran but did not produce the expected outputs;
            // retrying the message would not change that.
            warn!(job_id = %job.job_id, "pipeline produced no result or log file");
            self.store.mark_failed(&job.job_id).await?;
            remove_workdir(workdir).await;
            return Ok(());
        };

        remove_workdir(workdir).await;

        let complete_time = Utc::now().timestamp();
        self.store
            .mark_completed(
                &job.job_id,
                &self.settings.results_bucket,
                &result_key,
                &log_key,
                complete_time,
            )
            .await?;

        kafka::publish(
            &self.producer,
            &self.settings.job_results_topic,
            &job.job_id,
            &JobCompleted {
                job_id: job.job_id.clone(),
                user_id: job.user_id.clone(),
                complete_time,
            },
        )
        .await?;

        kafka::publish_after(
            &self.producer,
            &self.settings.archive_topic,
            &job.job_id,
            &ArchiveScheduled {
                bucket: self.settings.results_bucket.clone(),
                key: result_key,
                user_id: job.user_id.clone(),
                job_id: job.job_id.clone(),
            },
            self.settings.archive_delay_secs,
        )
        .await?;

        info!(job_id = %job.job_id, "job completed");
        Ok(())
    }
}

async fn remove_workdir(workdir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(workdir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(?workdir, %e, "failed to remove working directory");
        }
    }
}

/// Files the pipeline left in the working directory, minus the original
/// input. Sorted for a stable upload order.
pub fn collect_artifacts(dir: &Path, input_file_name: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy() == input_file_name {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_exclude_the_original_input() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["sample.vcf", "sample.annot.vcf", "sample.vcf.count.log"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("scratch")).unwrap();

        let files = collect_artifacts(dir.path(), "sample.vcf").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sample.annot.vcf", "sample.vcf.count.log"]);
    }

    #[test]
    fn artifact_classification_matches_key_layout() {
        let result = keys::result_key("acme", "u1", "j1", "sample.annot.vcf");
        let log = keys::result_key("acme", "u1", "j1", "sample.vcf.count.log");
        assert!(keys::is_result_file(&result));
        assert!(keys::is_log_file(&log));
        assert!(result.ends_with(".annot.vcf"));
        assert!(log.ends_with(".log"));
    }
}
