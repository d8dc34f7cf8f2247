//! Push front-end for the annotator: the bus delivers job requests over HTTP
//! instead of the long-poll loop. Both paths feed the same handler.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::{error, info, warn};

use shared::dto::BusCallback;

use crate::worker::{Annotator, Disposition};

/// Header carrying the callback type of an HTTP bus delivery.
pub const MESSAGE_TYPE_HEADER: &str = "x-amz-sns-message-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    SubscriptionConfirmation,
    Notification,
    Unknown,
}

pub fn callback_kind(header_value: Option<&str>) -> CallbackKind {
    match header_value {
        Some("SubscriptionConfirmation") => CallbackKind::SubscriptionConfirmation,
        Some("Notification") => CallbackKind::Notification,
        _ => CallbackKind::Unknown,
    }
}

/// GETs to the webhook are not part of the callback protocol.
pub async fn reject_get() -> HttpResponse {
    HttpResponse::MethodNotAllowed().json(json!({
        "code": 405,
        "error": "expecting a bus POST request"
    }))
}

pub async fn process_job_request(
    req: HttpRequest,
    body: web::Bytes,
    annotator: web::Data<Arc<Annotator>>,
) -> HttpResponse {
    let kind = callback_kind(
        req.headers()
            .get(MESSAGE_TYPE_HEADER)
            .and_then(|v| v.to_str().ok()),
    );

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

    match kind {
        CallbackKind::SubscriptionConfirmation => confirm_subscription(&callback).await,
        CallbackKind::Notification => {
            let Some(message) = callback.message.as_deref() else {
                return HttpResponse::BadRequest().json(json!({
                    "code": 400,
                    "error": "notification without message"
                }));
            };
            match annotator.handle_payload(message).await {
                Disposition::Ack => HttpResponse::Ok().json(json!({
                    "code": 200,
                    "message": "annotation job request processed"
                })),
                // A non-2xx response makes the bus redeliver the callback.
                Disposition::Retry => HttpResponse::InternalServerError().json(json!({
                    "code": 500,
                    "error": "job request processing failed"
                })),
            }
        }
        CallbackKind::Unknown => HttpResponse::BadRequest().json(json!({
            "code": 400,
            "error": "unsupported callback type"
        })),
    }
}

/// First delivery on an HTTP callback bus: GET the confirmation URL so
/// notifications start flowing.
pub async fn confirm_subscription(callback: &BusCallback) -> HttpResponse {
    let Some(url) = callback.subscribe_url.as_deref() else {
        return HttpResponse::BadRequest().json(json!({
            "code": 400,
            "error": "confirmation without SubscribeURL"
        }));
    };
    match shared::kafka::confirm_subscription(url).await {
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

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test as actix_test;
    use actix_web::App;

    #[test]
    fn header_dispatch() {
        assert_eq!(
            callback_kind(Some("SubscriptionConfirmation")),
            CallbackKind::SubscriptionConfirmation
        );
        assert_eq!(
            callback_kind(Some("Notification")),
            CallbackKind::Notification
        );
        assert_eq!(callback_kind(Some("Bogus")), CallbackKind::Unknown);
        assert_eq!(callback_kind(None), CallbackKind::Unknown);
    }

    #[actix_rt::test]
    async fn get_is_rejected() {
        let app = actix_test::init_service(
            App::new().route("/process-job-request", web::get().to(reject_get)),
        )
        .await;
        let req = actix_test::TestRequest::get()
            .uri("/process-job-request")
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::METHOD_NOT_ALLOWED);
    }
}
