//! Initiates cold-storage retrieval for upgraded users' archived results.
//!
//! Retrieval is asynchronous: this service only starts it, passing the
//! application job id as the retrieval description and the restore topic as
//! the completion target. The restore service finishes the round trip.

use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::Message;
use tokio::task::LocalSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use shared::config::Settings;
use shared::dto::ThawRequested;
use shared::error::AppError;
use shared::kafka;
use shared::storage;
use shared::vault::{ColdVault, RetrievalTier};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

struct Thawer {
    vault: ColdVault,
    restore_topic: String,
}

impl Thawer {
    /// Start a retrieval, preferring the fast tier and falling back to
    /// standard when expedited capacity is exhausted.
    async fn handle_thaw(&self, msg: &ThawRequested) -> Result<(), AppError> {
        match self.initiate(msg, RetrievalTier::Expedited).await {
            Ok(()) => Ok(()),
            Err(AppError::Capacity(reason)) => {
                warn!(job_id = %msg.job_id, %reason, "expedited capacity exhausted, falling back");
                self.initiate(msg, RetrievalTier::Standard).await
            }
            Err(e) => Err(e),
        }
    }

    async fn initiate(&self, msg: &ThawRequested, tier: RetrievalTier) -> Result<(), AppError> {
        let retrieval_job_id = self
            .vault
            .initiate_retrieval(&msg.archive_id, tier, &self.restore_topic, &msg.job_id)
            .await?;
        info!(
            job_id = %msg.job_id,
            archive_id = %msg.archive_id,
            %retrieval_job_id,
            %tier,
            "retrieval initiated"
        );
        Ok(())
    }
}

/// Tokio entry point that delegates to [`app_main`] on a local task set.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let local = LocalSet::new();
    local.run_until(async { app_main().await }).await
}

/// Sets up dependencies and runs the thaw event loop.
async fn app_main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "invalid configuration");
            std::process::exit(1);
        }
    };
    if settings.restore_sns_topic.is_empty() {
        error!("RESTORE_SNS_TOPIC must be set so retrieval completions can be routed");
        std::process::exit(1);
    }

    if let Err(e) = kafka::ensure_topics(
        &settings.message_broker_url,
        &[&settings.thaw_topic, &settings.dead_letter_topic],
    )
    .await
    {
        warn!(%e, "failed to ensure topics (continuing)");
    }

    let aws = storage::aws_config_for(&settings.aws_region).await;
    let vault = ColdVault::new(&aws, &settings.vault_name);

    let consumer = match kafka::consumer(
        &settings.message_broker_url,
        "thaw",
        &[&settings.thaw_topic],
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

    let thawer = Thawer {
        vault,
        restore_topic: settings.restore_sns_topic.clone(),
    };

    info!(
        "thaw worker started (broker={}, topic={})",
        settings.message_broker_url, settings.thaw_topic
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

                let msg = match kafka::unwrap_message::<ThawRequested>(payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(%e, "dropping poison thaw request");
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
                                    "delivery attempts exhausted, parked thaw request"
                                );
                                let _ = consumer.commit_message(&m, CommitMode::Async);
                                break;
                            }
                            Err(e) => {
                                error!(%e, "failed to park thaw request");
                                tokio::time::sleep(RETRY_BACKOFF).await;
                                continue;
                            }
                        }
                    }

                    match thawer.handle_thaw(&msg).await {
                        Ok(()) => {
                            let _ = consumer.commit_message(&m, CommitMode::Async);
                            break;
                        }
                        Err(e) => {
                            attempts += 1;
                            warn!(job_id = %msg.job_id, %e, attempts, "retrying retrieval");
                            tokio::time::sleep(RETRY_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}
