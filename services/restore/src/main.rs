//! Finishes the thaw round trip: the cold-storage layer announces completed
//! retrievals over an HTTP callback, and this service puts the bytes back at
//! the job's original result coordinates.

use std::sync::Arc;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use shared::config::Settings;
use shared::db::JobStore;
use shared::dto::{BusCallback, RetrievalReady};
use shared::error::AppError;
use shared::kafka;
use shared::storage::{self, ObjectStorage};
use shared::vault::ColdVault;

/// Header carrying the callback type of an HTTP bus delivery.
const MESSAGE_TYPE_HEADER: &str = "x-amz-sns-message-type";

struct Restorer {
    store: JobStore,
    storage: ObjectStorage,
    vault: ColdVault,
}

impl Restorer {
    /// Rehydrate one job's result from a completed retrieval. Every step
    /// tolerates a redelivery of the same event.
    async fn handle_retrieval(&self, msg: &RetrievalReady) -> Result<(), AppError> {
        if !msg.completed || msg.status_code != "Succeeded" {
            info!(
                retrieval_job_id = %msg.job_id,
                status = %msg.status_code,
                "ignoring incomplete retrieval event"
            );
            return Ok(());
        }

        let job = match self.store.get_job(&msg.job_description).await {
            Ok(job) => job,
            Err(AppError::NotFound(reason)) => {
                warn!(%reason, "retrieval for unknown job, dropping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let (Some(bucket), Some(key)) = (&job.result_bucket, &job.result_key) else {
            warn!(job_id = %job.job_id, "job has no result coordinates, dropping");
            return Ok(());
        };

        let bytes = self.vault.retrieval_bytes(&msg.job_id).await?;
        self.storage.upload_bytes(bytes, bucket, key).await?;
        self.vault.delete_archive(&msg.archive_id).await?;
        self.store.clear_archive_id(&job.job_id).await?;

        info!(job_id = %job.job_id, key = %key, "result restored to hot storage");
        Ok(())
    }
}

/// GETs to the webhook are not part of the callback protocol.
async fn reject_get() -> HttpResponse {
    HttpResponse::MethodNotAllowed().json(json!({
        "code": 405,
        "error": "expecting a bus POST request"
    }))
}

async fn process_restore_request(
    req: HttpRequest,
    body: web::Bytes,
    restorer: web::Data<Arc<Restorer>>,
) -> HttpResponse {
    let message_type = req
        .headers()
        .get(MESSAGE_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let callback: BusCallback = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => {
            warn!(%e, "unreadable webhook body");
            return HttpResponse::BadRequest().json(json!({
                "code": 400,
                "error": "unreadable callback body"
            }));
        }
    };

    match message_type {
        "SubscriptionConfirmation" => {
            let Some(url) = callback.subscribe_url.as_deref() else {
                return HttpResponse::BadRequest().json(json!({
                    "code": 400,
                    "error": "confirmation without SubscribeURL"
                }));
            };
            match kafka::confirm_subscription(url).await {
                Ok(()) => {
                    info!("bus subscription confirmed");
                    HttpResponse::Ok().json(json!({
                        "code": 200,
                        "message": "subscription confirmed"
                    }))
                }
                Err(e) => {
                    error!(%e, "unable to confirm subscription");
                    HttpResponse::InternalServerError().json(json!({
                        "code": 500,
                        "error": "failed to confirm subscription"
                    }))
                }
            }
        }
        "Notification" => {
            let Some(message) = callback.message.as_deref() else {
                return HttpResponse::BadRequest().json(json!({
                    "code": 400,
                    "error": "notification without message"
                }));
            };
            let msg = match kafka::unwrap_message::<RetrievalReady>(message) {
                Ok(msg) => msg,
                Err(e) => {
                    // Poison: acknowledging stops the bus from retrying it.
                    warn!(%e, "dropping poison retrieval event");
                    return HttpResponse::Ok().json(json!({
                        "code": 200,
                        "message": "event discarded"
                    }));
                }
            };
            match restorer.handle_retrieval(&msg).await {
                Ok(()) => HttpResponse::Ok().json(json!({
                    "code": 200,
                    "message": "retrieval event processed"
                })),
                // Non-2xx makes the bus redeliver the callback.
                Err(e) => {
                    error!(%e, "retrieval handling failed");
                    HttpResponse::InternalServerError().json(json!({
                        "code": 500,
                        "error": "retrieval handling failed"
                    }))
                }
            }
        }
        _ => HttpResponse::BadRequest().json(json!({
            "code": 400,
            "error": "unsupported callback type"
        })),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let store = match JobStore::connect(&settings.database_url).await {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "failed to connect to metadata store");
            std::process::exit(1);
        }
    };

    let aws = storage::aws_config_for(&settings.aws_region).await;
    let object_storage = match ObjectStorage::new(&aws, &settings.aws_region) {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "failed to set up object storage");
            std::process::exit(1);
        }
    };
    let vault = ColdVault::new(&aws, &settings.vault_name);

    let restorer = Arc::new(Restorer {
        store,
        storage: object_storage,
        vault,
    });
    let data = web::Data::new(restorer);

    info!("starting restore service on :8092");
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route(
                "/process-restore-request",
                web::post().to(process_restore_request),
            )
            .route("/process-restore-request", web::get().to(reject_get))
    })
    .bind(("0.0.0.0", 8092))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;

    #[actix_rt::test]
    async fn get_is_rejected() {
        let app = test::init_service(
            App::new().route("/process-restore-request", web::get().to(reject_get)),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/process-restore-request")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::METHOD_NOT_ALLOWED);
    }
}
