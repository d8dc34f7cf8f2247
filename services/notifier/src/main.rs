//! Consumes job completion events and emails the owning user, once per job.

use std::time::Duration;

use chrono::{FixedOffset, TimeZone};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::Message as KafkaMessage;
use tokio::task::LocalSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use shared::config::Settings;
use shared::db::JobStore;
use shared::dto::JobCompleted;
use shared::error::AppError;
use shared::{identity, kafka};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Render an epoch timestamp in the configured display time zone.
fn format_timestamp(ts: i64, offset_hours: i32, label: &str) -> String {
    let offset = FixedOffset::east_opt(offset_hours * 3600)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    match offset.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => {
            format!("{} {label}", dt.format("%Y-%m-%d %H:%M:%S"))
        }
        _ => ts.to_string(),
    }
}

struct Notifier {
    store: JobStore,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    settings: Settings,
}

impl Notifier {
    /// Build and send the completion email for one job.
    ///
    /// `NotFound`/`Schema` mean the recipient can never be resolved and the
    /// message should be dropped; `Transport` is worth a retry.
    async fn handle_completion(&self, msg: &JobCompleted) -> Result<(), AppError> {
        let profile = identity::get_user_profile(self.store.pool(), &msg.user_id).await?;
        let recipient: Mailbox = profile
            .email
            .parse()
            .map_err(|e| AppError::Schema(format!("recipient {}: {e}", profile.email)))?;

        let when = format_timestamp(
            msg.complete_time,
            self.settings.display_tz_offset_hours,
            &self.settings.display_tz_label,
        );
        let link = format!("{}/annotations/{}", self.settings.web_base_url, msg.job_id);

        let email = Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(format!("Annotation job {} completed", msg.job_id))
            .body(format!(
                "Your annotation job finished at {when}.\n\nView the results: {link}\n"
            ))
            .map_err(|e| AppError::Schema(format!("build email: {e}")))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| AppError::Transport(format!("send email: {e}")))?;

        info!(job_id = %msg.job_id, user_id = %msg.user_id, "completion email sent");
        Ok(())
    }
}

/// Tokio entry point that delegates to [`app_main`] on a local task set.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let local = LocalSet::new();
    local.run_until(async { app_main().await }).await
}

/// Sets up dependencies and runs the notifier event loop.
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
        &[&settings.job_results_topic, &settings.dead_letter_topic],
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

    let sender: Mailbox = match settings.email_sender.parse() {
        Ok(m) => m,
        Err(e) => {
            error!(%e, sender = %settings.email_sender, "invalid sender identity");
            std::process::exit(1);
        }
    };
    let mut transport = match AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host) {
        Ok(t) => t,
        Err(e) => {
            error!(%e, host = %settings.smtp_host, "invalid SMTP relay");
            std::process::exit(1);
        }
    };
    if !settings.smtp_username.is_empty() {
        transport = transport.credentials(Credentials::new(
            settings.smtp_username.clone(),
            settings.smtp_password.clone(),
        ));
    }
    let mailer = transport.build();

    let consumer = match kafka::consumer(
        &settings.message_broker_url,
        "notifier",
        &[&settings.job_results_topic],
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

    let notifier = Notifier {
        store,
        mailer,
        sender,
        settings: settings.clone(),
    };

    info!(
        "notifier started (broker={}, topic={})",
        settings.message_broker_url, settings.job_results_topic
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

                let msg = match kafka::unwrap_message::<JobCompleted>(payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(%e, "dropping poison completion event");
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
                                    "delivery attempts exhausted, parked completion event"
                                );
                                let _ = consumer.commit_message(&m, CommitMode::Async);
                                break;
                            }
                            Err(e) => {
                                error!(%e, "failed to park completion event");
                                tokio::time::sleep(RETRY_BACKOFF).await;
                                continue;
                            }
                        }
                    }

                    match notifier.handle_completion(&msg).await {
                        Ok(()) => {
                            let _ = consumer.commit_message(&m, CommitMode::Async);
                            break;
                        }
                        Err(AppError::NotFound(reason)) | Err(AppError::Schema(reason)) => {
                            // Permanent: no recipient will ever materialize.
                            warn!(job_id = %msg.job_id, %reason, "dropping unnotifiable job");
                            let _ = consumer.commit_message(&m, CommitMode::Async);
                            break;
                        }
                        Err(e) => {
                            attempts += 1;
                            warn!(job_id = %msg.job_id, %e, attempts, "retrying notification");
                            tokio::time::sleep(RETRY_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_in_display_zone() {
        assert_eq!(
            format_timestamp(1_609_459_200, -6, "CST"),
            "2020-12-31 18:00:00 CST"
        );
    }
}
