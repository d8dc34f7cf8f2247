//! HTTP handlers for the request intake and the read API.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{FixedOffset, TimeZone, Utc};
use rdkafka::producer::FutureProducer;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use shared::config::Settings;
use shared::db::JobStore;
use shared::dto::{JobRecord, JobStatus, JobSubmitted, ThawRequested};
use shared::error::AppError;
use shared::identity::{self, Role};
use shared::keys;
use shared::storage::{ObjectStorage, PostConditions};
use shared::kafka;

pub struct AppState {
    pub store: JobStore,
    pub storage: ObjectStorage,
    pub producer: FutureProducer,
    pub settings: Settings,
}

/// The authenticated principal, established by the identity layer in front of
/// this service and forwarded in a header.
pub fn authenticated_user(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Render an epoch timestamp in the configured display time zone.
pub fn format_timestamp(ts: i64, offset_hours: i32, label: &str) -> String {
    let offset = FixedOffset::east_opt(offset_hours * 3600)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    match offset.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => {
            format!("{} {label}", dt.format("%Y-%m-%d %H:%M:%S"))
        }
        _ => ts.to_string(),
    }
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(json!({ "code": 401, "error": "not authenticated" }))
}

fn forbidden() -> HttpResponse {
    HttpResponse::Forbidden().json(json!({ "code": 403, "error": "not authorized for this job" }))
}

fn not_found(what: &str) -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "code": 404, "error": format!("{what} not found") }))
}

fn internal_error(message: &str) -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "code": 500, "error": message }))
}

/// `GET /annotate` — mint an upload key and return the presigned POST form.
/// The form fields are passed to the uploader verbatim.
pub async fn annotate(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    let Some(user_id) = authenticated_user(&req) else {
        return unauthorized();
    };

    let settings = &data.settings;
    let job_id = keys::new_job_id();
    let key = keys::upload_key(&settings.key_prefix, &user_id, &job_id);
    let redirect_url = format!("{}/annotate/job", settings.web_base_url);

    match data
        .storage
        .presigned_post(
            &settings.inputs_bucket,
            &key,
            &PostConditions {
                redirect_url: &redirect_url,
                acl: &settings.s3_acl,
                encryption: &settings.s3_encryption,
                ttl_secs: settings.signed_url_ttl_secs,
            },
        )
        .await
    {
        Ok(post) => {
            let fields: serde_json::Map<String, serde_json::Value> = post
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            HttpResponse::Ok().json(json!({ "url": post.url, "fields": fields }))
        }
        Err(e) => {
            error!(%e, "unable to generate presigned upload form");
            internal_error("unable to generate upload form")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadRedirect {
    pub bucket: String,
    pub key: String,
}

/// `GET /annotate/job` — the object-store redirect after a successful
/// upload: persist the PENDING record and publish the submission event.
pub async fn create_annotation_job(
    req: HttpRequest,
    query: web::Query<UploadRedirect>,
    data: web::Data<AppState>,
) -> HttpResponse {
    let Some(user_id) = authenticated_user(&req) else {
        return unauthorized();
    };

    let parsed = match keys::parse_input_key(&query.key) {
        Ok(p) => p,
        Err(e) => {
            warn!(%e, key = %query.key, "rejecting malformed upload key");
            return HttpResponse::BadRequest()
                .json(json!({ "code": 400, "error": "malformed upload key" }));
        }
    };
    if parsed.user_id != user_id {
        return forbidden();
    }

    let record = JobRecord {
        job_id: parsed.job_id.clone(),
        user_id: parsed.user_id.clone(),
        input_file_name: parsed.filename.clone(),
        input_bucket: query.bucket.clone(),
        input_key: query.key.clone(),
        submit_time: Utc::now().timestamp(),
        job_status: JobStatus::Pending,
        result_bucket: None,
        result_key: None,
        log_key: None,
        complete_time: None,
        results_file_archive_id: None,
    };

    match data.store.insert_job(&record).await {
        Ok(()) => {}
        Err(AppError::AlreadyExists(_)) => {
            return HttpResponse::Conflict()
                .json(json!({ "code": 409, "error": "job already submitted" }));
        }
        Err(e) => {
            error!(%e, job_id = %record.job_id, "failed to persist job");
            return internal_error("failed to persist job");
        }
    }

    let submitted = JobSubmitted {
        job_id: record.job_id.clone(),
        user_id: record.user_id.clone(),
        input_bucket: record.input_bucket.clone(),
        input_key: record.input_key.clone(),
        input_file_name: record.input_file_name.clone(),
        submit_time: record.submit_time,
    };
    if let Err(e) = kafka::publish(
        &data.producer,
        &data.settings.job_requests_topic,
        &record.job_id,
        &submitted,
    )
    .await
    {
        error!(%e, job_id = %record.job_id, "failed to publish job submission");
        return internal_error("failed to publish job submission");
    }

    info!(job_id = %record.job_id, user_id = %record.user_id, "job submitted");
    HttpResponse::Ok().json(json!({ "job_id": record.job_id }))
}

/// `GET /annotations` — the caller's jobs, newest first.
pub async fn annotations_list(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    let Some(user_id) = authenticated_user(&req) else {
        return unauthorized();
    };

    let jobs = match data.store.jobs_for_user(&user_id).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(%e, "failed to query annotations");
            return internal_error("failed to query annotations");
        }
    };

    let settings = &data.settings;
    let rows: Vec<_> = jobs
        .iter()
        .map(|job| {
            json!({
                "job_id": job.job_id,
                "submit_time": format_timestamp(
                    job.submit_time,
                    settings.display_tz_offset_hours,
                    &settings.display_tz_label,
                ),
                "input_file_name": job.input_file_name,
                "job_status": job.job_status,
                "link": format!("{}/annotations/{}", settings.web_base_url, job.job_id),
            })
        })
        .collect();
    HttpResponse::Ok().json(rows)
}

/// `GET /annotations/{job_id}` — job detail with role-gated result access.
pub async fn annotation_details(
    req: HttpRequest,
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> HttpResponse {
    let Some(user_id) = authenticated_user(&req) else {
        return unauthorized();
    };
    let job_id = path.into_inner();

    let job = match data.store.get_job(&job_id).await {
        Ok(job) => job,
        Err(AppError::NotFound(_)) => return not_found("job"),
        Err(e) => {
            error!(%e, %job_id, "failed to load job");
            return internal_error("failed to load job");
        }
    };
    if job.user_id != user_id {
        return forbidden();
    }

    let settings = &data.settings;
    let input_link = data
        .storage
        .presigned_get(&job.input_bucket, &job.input_key, settings.signed_url_ttl_secs)
        .await
        .ok();

    let mut detail = json!({
        "job_id": job.job_id,
        "request_time": format_timestamp(
            job.submit_time,
            settings.display_tz_offset_hours,
            &settings.display_tz_label,
        ),
        "input_file": { "name": job.input_file_name, "link": input_link },
        "job_status": job.job_status,
    });

    if job.job_status == JobStatus::Completed {
        if let Some(ct) = job.complete_time {
            detail["complete_time"] = json!(format_timestamp(
                ct,
                settings.display_tz_offset_hours,
                &settings.display_tz_label,
            ));
        }

        detail["result_file"] = if job.results_file_archive_id.is_some() {
            let role = match identity::get_user_profile(data.store.pool(), &user_id).await {
                Ok(profile) => profile.role,
                Err(e) => {
                    warn!(%e, "profile lookup failed, assuming free tier");
                    Role::FreeUser
                }
            };
            if role.is_premium() {
                json!({ "status": "file is being restored; please check back later" })
            } else {
                json!({ "status": "upgrade to premium for download", "upgrade_link": "/subscribe" })
            }
        } else {
            match (&job.result_bucket, &job.result_key) {
                (Some(bucket), Some(key)) => {
                    match data
                        .storage
                        .presigned_get(bucket, key, settings.signed_url_ttl_secs)
                        .await
                    {
                        Ok(link) => json!({ "download_link": link }),
                        Err(e) => {
                            error!(%e, %job_id, "unable to presign result download");
                            return internal_error("unable to generate download link");
                        }
                    }
                }
                _ => {
                    error!(%job_id, "completed job without result coordinates");
                    return internal_error("job record is incomplete");
                }
            }
        };
        detail["log_link"] = json!(format!(
            "{}/annotations/{}/log",
            settings.web_base_url, job.job_id
        ));
    }

    HttpResponse::Ok().json(detail)
}

/// `GET /annotations/{job_id}/log` — the annotation log body.
pub async fn annotation_log(
    req: HttpRequest,
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> HttpResponse {
    let Some(user_id) = authenticated_user(&req) else {
        return unauthorized();
    };
    let job_id = path.into_inner();

    let job = match data.store.get_job(&job_id).await {
        Ok(job) => job,
        Err(AppError::NotFound(_)) => return not_found("job"),
        Err(e) => {
            error!(%e, %job_id, "failed to load job");
            return internal_error("failed to load job");
        }
    };
    if job.user_id != user_id {
        return forbidden();
    }
    if job.job_status != JobStatus::Completed {
        return HttpResponse::Unauthorized()
            .json(json!({ "code": 401, "error": "job is not completed yet" }));
    }

    let (Some(bucket), Some(log_key)) = (&job.result_bucket, &job.log_key) else {
        error!(%job_id, "completed job without log coordinates");
        return internal_error("job record is incomplete");
    };
    match data.storage.get_bytes(bucket, log_key).await {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => HttpResponse::Ok().content_type("text/plain").body(text),
            Err(e) => {
                error!(%e, %job_id, "log object is not valid UTF-8");
                internal_error("log is unreadable")
            }
        },
        Err(e) => {
            error!(%e, %job_id, "failed to fetch log");
            internal_error("failed to fetch log")
        }
    }
}

/// `POST /subscribe` — upgrade the caller to premium and request restoration
/// of every archived result. Payment handling lives outside this service.
pub async fn subscribe(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    let Some(user_id) = authenticated_user(&req) else {
        return unauthorized();
    };

    match identity::set_role(data.store.pool(), &user_id, Role::PremiumUser).await {
        Ok(()) => {}
        Err(AppError::NotFound(_)) => return not_found("user"),
        Err(e) => {
            error!(%e, "failed to update subscription role");
            return internal_error("failed to update subscription");
        }
    }

    let archived = match data.store.archived_jobs_for_user(&user_id).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(%e, "failed to query archived jobs");
            return internal_error("failed to query archived jobs");
        }
    };

    let mut requested = 0usize;
    for job in &archived {
        let Some(archive_id) = &job.results_file_archive_id else {
            continue;
        };
        let msg = ThawRequested {
            user_id: user_id.clone(),
            archive_id: archive_id.clone(),
            job_id: job.job_id.clone(),
        };
        if let Err(e) = kafka::publish(
            &data.producer,
            &data.settings.thaw_topic,
            &job.job_id,
            &msg,
        )
        .await
        {
            // The role change already landed; re-posting /subscribe retries
            // the remaining thaw requests idempotently.
            error!(%e, job_id = %job.job_id, "failed to publish thaw request");
            return internal_error("failed to request restoration");
        }
        requested += 1;
    }

    info!(%user_id, requested, "subscription upgraded");
    HttpResponse::Ok().json(json!({
        "message": "subscription upgraded",
        "restorations_requested": requested
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn reads_principal_from_header() {
        let req = TestRequest::default()
            .insert_header(("x-user-id", "u1"))
            .to_http_request();
        assert_eq!(authenticated_user(&req).as_deref(), Some("u1"));

        let req = TestRequest::default().to_http_request();
        assert_eq!(authenticated_user(&req), None);

        let req = TestRequest::default()
            .insert_header(("x-user-id", "  "))
            .to_http_request();
        assert_eq!(authenticated_user(&req), None);
    }

    #[test]
    fn formats_timestamps_in_display_zone() {
        // 2021-01-01T00:00:00Z at UTC-6.
        assert_eq!(
            format_timestamp(1_609_459_200, -6, "CST"),
            "2020-12-31 18:00:00 CST"
        );
        assert_eq!(
            format_timestamp(1_609_459_200, 0, "UTC"),
            "2021-01-01 00:00:00 UTC"
        );
    }
}
