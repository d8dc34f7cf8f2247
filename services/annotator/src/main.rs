//! Entry point for the annotator worker: long-polls the job request queue,
//! exposes the push webhook, and supervises one pipeline run per job.

mod webhook;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::Message;
use tokio::task::LocalSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use shared::config::Settings;
use shared::db::JobStore;
use shared::kafka;
use shared::storage::{self, ObjectStorage};

use worker::{Annotator, Disposition};

/// In-place redelivery: attempts per message before it is parked on the
/// dead-letter topic.
const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Tokio entry point that delegates to [`app_main`] on a local task set.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let local = LocalSet::new();
    local.run_until(async { app_main().await }).await
}

/// Sets up dependencies and runs the annotator event loop.
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
        &[
            &settings.job_requests_topic,
            &settings.job_results_topic,
            &settings.archive_topic,
            &settings.dead_letter_topic,
        ],
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
    if let Err(e) = store.ensure_schema().await {
        error!(%e, "failed to ensure schema");
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

    let producer = match kafka::producer(&settings.message_broker_url) {
        Ok(p) => p,
        Err(e) => {
            error!(%e, "failed to create producer");
            std::process::exit(1);
        }
    };
    let consumer = match kafka::consumer(
        &settings.message_broker_url,
        "annotator",
        &[&settings.job_requests_topic],
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "failed to create consumer");
            std::process::exit(1);
        }
    };

    let annotator = Arc::new(Annotator {
        store,
        storage: object_storage,
        producer,
        settings: settings.clone(),
    });

    // Webhook front-end for push-style buses; shares the handler with the
    // poll loop below.
    let webhook_state = annotator.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(webhook_state.clone()))
            .route(
                "/process-job-request",
                web::post().to(webhook::process_job_request),
            )
            .route("/process-job-request", web::get().to(webhook::reject_get))
    })
    .bind(("0.0.0.0", 8091))?
    .run();
    tokio::spawn(server);

    info!(
        "annotator started (broker={}, topic={})",
        settings.message_broker_url, settings.job_requests_topic
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
                let payload = payload.to_string();
                let key = m
                    .key()
                    .and_then(|k| std::str::from_utf8(k).ok())
                    .unwrap_or_default()
                    .to_string();

                let mut attempts = 0;
                loop {
                    // Exhausted deliveries are parked, never silently acked.
                    if attempts >= MAX_ATTEMPTS {
                        match kafka::dead_letter(
                            &annotator.producer,
                            &settings.dead_letter_topic,
                            &key,
                            &payload,
                        )
                        .await
                        {
                            Ok(()) => {
                                error!(
                                    attempts,
                                    topic = %settings.dead_letter_topic,
                                    "delivery attempts exhausted, parked job request"
                                );
                                let _ = consumer.commit_message(&m, CommitMode::Async);
                                break;
                            }
                            Err(e) => {
                                error!(%e, "failed to park job request");
                                tokio::time::sleep(RETRY_BACKOFF).await;
                                continue;
                            }
                        }
                    }

                    match annotator.handle_payload(&payload).await {
                        Disposition::Ack => {
                            if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                                warn!(%e, "failed to commit offset");
                            }
                            break;
                        }
                        Disposition::Retry => {
                            attempts += 1;
                            warn!(attempts, "retrying job request");
                            tokio::time::sleep(RETRY_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}
