use reqwest::StatusCode;

use crate::drivers::{classify_reqwest, CreateBookmarkRequest, CreateEventRequest, DriverError, ThumbnailParams};

use super::VmsConfig;

/// Create a generic event in the VMS timeline, optionally tagged with
/// camera references.
pub async fn create_event(
    http: &reqwest::Client,
    cfg: &VmsConfig,
    request: &CreateEventRequest,
) -> Result<(), DriverError> {
    let url = format!("{}/api/events", cfg.base_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "source": request.source,
        "caption": request.caption,
        "description": request.description,
        "timestampMs": request.timestamp_ms,
        "metadata": { "cameraRefs": request.camera_refs },
    });
    let response = http
        .post(&url)
        .bearer_auth(&cfg.api_token)
        .json(&body)
        .send()
        .await
        .map_err(classify_reqwest)?;
    check_status(response).await
}

/// Create a bookmark on one camera's timeline.
pub async fn create_bookmark(
    http: &reqwest::Client,
    cfg: &VmsConfig,
    camera_external_id: &str,
    request: &CreateBookmarkRequest,
) -> Result<(), DriverError> {
    let url = format!(
        "{}/api/cameras/{}/bookmarks",
        cfg.base_url.trim_end_matches('/'),
        camera_external_id
    );
    let response = http
        .post(&url)
        .bearer_auth(&cfg.api_token)
        .json(request)
        .send()
        .await
        .map_err(classify_reqwest)?;
    check_status(response).await
}

/// Fetch a thumbnail image; returns the bytes and their content type.
pub async fn fetch_thumbnail(
    http: &reqwest::Client,
    cfg: &VmsConfig,
    camera_external_id: &str,
    params: ThumbnailParams,
) -> Result<(Vec<u8>, String), DriverError> {
    let url = format!(
        "{}/api/cameras/{}/thumbnail",
        cfg.base_url.trim_end_matches('/'),
        camera_external_id
    );
    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(size) = params.size {
        query.push(("size", size.to_string()));
    }
    if let Some(at_ms) = params.at_ms {
        query.push(("atMs", at_ms.to_string()));
    }
    let response = http
        .get(&url)
        .query(&query)
        .bearer_auth(&cfg.api_token)
        .send()
        .await
        .map_err(classify_reqwest)?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(DriverError::Auth(format!("VMS rejected thumbnail request: {}", status)));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DriverError::Rejected(status.as_u16(), body));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = response.bytes().await.map_err(classify_reqwest)?;
    Ok((bytes.to_vec(), content_type))
}

async fn check_status(response: reqwest::Response) -> Result<(), DriverError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(DriverError::Auth(format!("VMS rejected credentials: {}", status)));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DriverError::Rejected(status.as_u16(), body));
    }
    Ok(())
}
