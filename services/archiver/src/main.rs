//! Moves free-tier results to cold storage once the retention window closes.
//!
//! The step order inside [`Archiver::archive`] is load-bearing: cold upload
//! before hot deletion before recording the archive id. A crash between the
//! first two orphans a cold copy (harmless garbage); the message stays
//! unacknowledged until the archive id is in the store.

use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::Message;
use tokio::task::LocalSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use shared::config::Settings;
use shared::db::JobStore;
use shared::dto::{ArchiveScheduled, Scheduled};
use shared::error::AppError;
use shared::storage::{self, ObjectStorage};
use shared::vault::ColdVault;
use shared::{identity, kafka};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

struct Archiver {
    store: JobStore,
    storage: ObjectStorage,
    vault: ColdVault,
}

impl Archiver {
    /// Archive one job's result, or skip it for premium users. Idempotent:
    /// a redelivery after a partial run repeats only the remaining steps'
    /// effects (a second cold copy at worst).
    async fn handle_scheduled(&self, msg: &ArchiveScheduled) -> Result<(), AppError> {
        let profile = identity::get_user_profile(self.store.pool(), &msg.user_id).await?;
        if profile.role.is_premium() {
            info!(job_id = %msg.job_id, "premium user, skipping archive");
            return Ok(());
        }
        self.archive(msg).await
    }

    async fn archive(&self, msg: &ArchiveScheduled) -> Result<(), AppError> {
        let bytes = match self.storage.get_bytes(&msg.bucket, &msg.key).await {
            Ok(bytes) => bytes,
            Err(AppError::NotFound(_)) => {
                // Hot copy already gone; either a peer finished the job or
                // the result was restored away. Nothing left to move.
                warn!(job_id = %msg.job_id, key = %msg.key, "hot result already absent");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let archive_id = self.vault.upload_archive(bytes).await?;
        self.storage.delete_object(&msg.bucket, &msg.key).await?;
        self.store.set_archive_id(&msg.job_id, &archive_id).await?;

        info!(job_id = %msg.job_id, %archive_id, "result archived");
        Ok(())
    }
}

/// Tokio entry point that delegates to [`app_main`] on a local task set.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let local = LocalSet::new();
    local.run_until(async { app_main().await }).await
}

/// Sets up dependencies and runs the archiver event loop.
async fn app_main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = kafka::ensure_topics(
        &settings.message_broker_url,
        &[&settings.archive_topic, &settings.dead_letter_topic],
    )
    .await
    {
        warn!(%e, "failed to ensure topics (continuing)");
    }

    let store = match JobStore::connect(&settings.database_url).await {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "failed to connect to metadata store");
            std::process::exit(1);
        }
    };
    if let Err(e) = identity::ensure_schema(store.pool()).await {
        error!(%e, "failed to ensure accounts schema");
        std::process::exit(1);
    }

    let aws = storage::aws_config_for(&settings.aws_region).await;
    let object_storage = match ObjectStorage::new(&aws, &settings.aws_region) {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "failed to set up object storage");
            std::process::exit(1);
        }
    };
    let vault = ColdVault::new(&aws, &settings.vault_name);

    let consumer = match kafka::consumer(
        &settings.message_broker_url,
        "archiver",
        &[&settings.archive_topic],
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "failed to create consumer");
            std::process::exit(1);
        }
    };
    let producer = match kafka::producer(&settings.message_broker_url) {
        Ok(p) => p,
        Err(e) => {
            error!(%e, "failed to create producer");
            std::process::exit(1);
        }
    };

    let archiver = Archiver {
        store,
        storage: object_storage,
        vault,
    };

    info!(
        "archiver started (broker={}, topic={})",
        settings.message_broker_url, settings.archive_topic
    );

    loop {
        match consumer.recv().await {
            Err(e) => {
                error!(%e, "queue receive failed");
                continue;
            }
            Ok(m) => {
                let Some(Ok(payload)) = m.payload_view::<str>() else {
                    warn!("received message without valid UTF-8 payload");
                    let _ = consumer.commit_message(&m, CommitMode::Async);
                    continue;
                };

                // Scheduled deliveries are held back until due, then the
                // inner archive request is unwrapped.
                let scheduled = match kafka::unwrap_message::<Scheduled>(payload) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(%e, "dropping poison archive request");
                        let _ = consumer.commit_message(&m, CommitMode::Async);
                        continue;
                    }
                };
                kafka::sleep_until_due(scheduled.deliver_at).await;

                let msg = match kafka::unwrap_message::<ArchiveScheduled>(&scheduled.message) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(%e, "dropping poison archive request");
                        let _ = consumer.commit_message(&m, CommitMode::Async);
                        continue;
                    }
                };

                let mut attempts = 0;
                loop {
                    // Exhausted deliveries are parked, never silently acked.
                    if attempts >= MAX_ATTEMPTS {
                        match kafka::dead_letter(
                            &producer,
                            &settings.dead_letter_topic,
                            &msg.job_id,
                            payload,
                        )
                        .await
                        {
                            Ok(()) => {
                                error!(
                                    job_id = %msg.job_id,
                                    topic = %settings.dead_letter_topic,
                                    "delivery attempts exhausted, parked archive request"
                                );
                                let _ = consumer.commit_message(&m, CommitMode::Async);
                                break;
                            }
                            Err(e) => {
                                error!(%e, "failed to park archive request");
                                tokio::time::sleep(RETRY_BACKOFF).await;
                                continue;
                            }
                        }
                    }

                    match archiver.handle_scheduled(&msg).await {
                        Ok(()) => {
                            let _ = consumer.commit_message(&m, CommitMode::Async);
                            break;
                        }
                        Err(AppError::NotFound(reason)) => {
                            warn!(job_id = %msg.job_id, %reason, "dropping archive request");
                            let _ = consumer.commit_message(&m, CommitMode::Async);
                            break;
                        }
                        Err(e) => {
                            attempts += 1;
                            warn!(job_id = %msg.job_id, %e, attempts, "retrying archive");
                            tokio::time::sleep(RETRY_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}
