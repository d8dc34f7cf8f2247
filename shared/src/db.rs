//! Metadata store client for annotation job records.
//!
//! The conditional updates here are the only cross-worker synchronization
//! primitive in the system: duplicate deliveries and worker races are
//! resolved by compare-and-set on `job_status`.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::dto::{JobRecord, JobStatus};
use crate::error::AppError;

/// Typed access to the `annotations` table.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

fn store_err(context: &str, e: sqlx::Error) -> AppError {
    AppError::Transport(format!("{context}: {e}"))
}

/// True when the error is a unique-constraint violation.
fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

impl JobStore {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| store_err("connect to metadata store", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Ensure the status enum, the annotations table, and the user index
    /// exist before handling data. Safe to run concurrently from every
    /// service at startup.
    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            DO $$
            BEGIN
                IF NOT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'job_status') THEN
                    CREATE TYPE job_status AS ENUM ('PENDING','RUNNING','COMPLETED','FAILED');
                END IF;
            END$$;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("create job_status type", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS annotations (
                job_id                  text PRIMARY KEY,
                user_id                 text NOT NULL,
                input_file_name         text NOT NULL,
                input_bucket            text NOT NULL,
                input_key               text NOT NULL,
                submit_time             bigint NOT NULL,
                job_status              job_status NOT NULL DEFAULT 'PENDING',
                result_bucket           text,
                result_key              text,
                log_key                 text,
                complete_time           bigint,
                results_file_archive_id text
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("create annotations table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_annotations_user_id ON annotations (user_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| store_err("create user index", e))?;

        Ok(())
    }

    /// Persist a freshly minted job. A duplicate `job_id` is rejected with
    /// [`AppError::AlreadyExists`].
    pub async fn insert_job(&self, job: &JobRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO annotations
               (job_id, user_id, input_file_name, input_bucket, input_key, submit_time, job_status)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&job.job_id)
        .bind(&job.user_id)
        .bind(&job.input_file_name)
        .bind(&job.input_bucket)
        .bind(&job.input_key)
        .bind(job.submit_time)
        .bind(job.job_status)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::AlreadyExists(format!("job {}", job.job_id))
            } else {
                store_err("insert job", e)
            }
        })?;
        Ok(())
    }

    /// Compare-and-set the job status. Exactly one of any number of
    /// concurrent callers with the same `from` wins; the rest observe
    /// [`AppError::Conflict`].
    pub async fn set_status_if(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<(), AppError> {
        let res = sqlx::query(
            "UPDATE annotations SET job_status = $3 WHERE job_id = $1 AND job_status = $2",
        )
        .bind(job_id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("conditional status update", e))?;

        if res.rows_affected() == 0 {
            // Distinguish a lost race from a missing record.
            let current = self.get_job(job_id).await?;
            return Err(AppError::Conflict(format!(
                "job {job_id} is {} not {from}",
                current.job_status
            )));
        }
        Ok(())
    }

    /// Record the completion artifacts and flip the job to `COMPLETED`.
    /// Conditioned on `RUNNING` so a duplicate completion is a no-op.
    pub async fn mark_completed(
        &self,
        job_id: &str,
        result_bucket: &str,
        result_key: &str,
        log_key: &str,
        complete_time: i64,
    ) -> Result<(), AppError> {
        let res = sqlx::query(
            "UPDATE annotations
                SET job_status = $2, result_bucket = $3, result_key = $4,
                    log_key = $5, complete_time = $6
              WHERE job_id = $1 AND job_status = $7",
        )
        .bind(job_id)
        .bind(JobStatus::Completed)
        .bind(result_bucket)
        .bind(result_key)
        .bind(log_key)
        .bind(complete_time)
        .bind(JobStatus::Running)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("mark completed", e))?;

        if res.rows_affected() == 0 {
            let current = self.get_job(job_id).await?;
            if current.job_status == JobStatus::Completed {
                return Ok(());
            }
            return Err(AppError::Conflict(format!(
                "job {job_id} is {} not RUNNING",
                current.job_status
            )));
        }
        Ok(())
    }

    /// Terminal failure from any non-terminal state; no-op once terminal.
    pub async fn mark_failed(&self, job_id: &str) -> Result<(), AppError> {
        let res = sqlx::query(
            "UPDATE annotations SET job_status = $2
              WHERE job_id = $1 AND job_status NOT IN ($3, $4)",
        )
        .bind(job_id)
        .bind(JobStatus::Failed)
        .bind(JobStatus::Completed)
        .bind(JobStatus::Failed)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("mark failed", e))?;

        if res.rows_affected() == 0 {
            // Either already terminal (fine) or missing (reported).
            let _ = self.get_job(job_id).await?;
        }
        Ok(())
    }

    /// Record the cold-storage handle after the hot copy was purged.
    pub async fn set_archive_id(&self, job_id: &str, archive_id: &str) -> Result<(), AppError> {
        let res =
            sqlx::query("UPDATE annotations SET results_file_archive_id = $2 WHERE job_id = $1")
                .bind(job_id)
                .bind(archive_id)
                .execute(&self.pool)
                .await
                .map_err(|e| store_err("set archive id", e))?;
        if res.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    /// Drop the cold-storage handle once the hot copy is back in place.
    pub async fn clear_archive_id(&self, job_id: &str) -> Result<(), AppError> {
        let res =
            sqlx::query("UPDATE annotations SET results_file_archive_id = NULL WHERE job_id = $1")
                .bind(job_id)
                .execute(&self.pool)
                .await
                .map_err(|e| store_err("clear archive id", e))?;
        if res.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord, AppError> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM annotations WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("get job", e))?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    pub async fn jobs_for_user(&self, user_id: &str) -> Result<Vec<JobRecord>, AppError> {
        sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM annotations WHERE user_id = $1 ORDER BY submit_time DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("query jobs by user", e))
    }

    /// Jobs whose results currently live in cold storage.
    pub async fn archived_jobs_for_user(&self, user_id: &str) -> Result<Vec<JobRecord>, AppError> {
        sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM annotations
              WHERE user_id = $1 AND results_file_archive_id IS NOT NULL",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("query archived jobs", e))
    }
}
