//! Actix Web service exposing the annotation intake (presigned uploads and
//! the upload redirect) and the read API for job listings, details, and logs.

mod handlers;

use actix_web::{web, App, HttpServer};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use shared::config::Settings;
use shared::db::JobStore;
use shared::storage::{self, ObjectStorage};
use shared::{identity, kafka};

use handlers::AppState;

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

    if let Err(e) = kafka::ensure_topics(
        &settings.message_broker_url,
        &[&settings.job_requests_topic, &settings.thaw_topic],
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

    let producer = match kafka::producer(&settings.message_broker_url) {
        Ok(p) => p,
        Err(e) => {
            error!(%e, "failed to create producer");
            std::process::exit(1);
        }
    };

    let data = web::Data::new(AppState {
        store,
        storage: object_storage,
        producer,
        settings,
    });

    info!("starting annotation API on :8090");
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/annotate", web::get().to(handlers::annotate))
            .route("/annotate/job", web::get().to(handlers::create_annotation_job))
            .route("/annotations", web::get().to(handlers::annotations_list))
            .route(
                "/annotations/{job_id}",
                web::get().to(handlers::annotation_details),
            )
            .route(
                "/annotations/{job_id}/log",
                web::get().to(handlers::annotation_log),
            )
            .route("/subscribe", web::post().to(handlers::subscribe))
    })
    .bind(("0.0.0.0", 8090))?
    .run()
    .await
}
