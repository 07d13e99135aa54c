use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream;
use tracing::instrument;

use api::PipelineRequest;
use common::carrier::CarrierIo;
use common::config::PipelineConfig;
use common::executor::PipelineExecutor;
use common::response::adapt;
use common::step::Registry;

use super::AppError;

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub config: Arc<PipelineConfig>,
}

// the single route this server exposes: takes the already decoded envelope
// (auth/signature verification is an external collaborator's job), runs the
// pipeline, and renders the result through the response adapter
#[instrument(skip_all)]
pub async fn run_pipeline(
    State(state): State<AppState>,
    Json(request): Json<PipelineRequest>,
) -> Result<Response, AppError> {
    let executor = PipelineExecutor::new(state.registry.clone(), state.config.clone());
    let carrier = executor.run(request.pipeline_steps).await?;
    let adapted = adapt(carrier)?;

    if adapted.is_json {
        let mut carrier = adapted.carrier;
        let body = carrier.read(-1).await.map_err(AppError::from)?;
        let mut response = (StatusCode::OK, body.to_vec()).into_response();
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        return Ok(response);
    }

    // pull the first chunk before committing to a status: a same-step
    // failure (missing zip member, bad crypt4gh key, ...) usually surfaces on
    // this very first read of a Queue-carrier-backed step, and mapping it
    // through AppError here is what lets it reach the client as the status
    // the error taxonomy defines instead of a 200 followed by a dropped
    // connection
    let chunk_size = state.config.chunk_size;
    let mut carrier = adapted.carrier;
    let first_chunk = carrier.read(chunk_size as i64).await.map_err(AppError::from)?;
    let pending = if first_chunk.is_empty() { None } else { Some(first_chunk) };

    let body = Body::from_stream(stream::unfold(
        (pending, carrier),
        move |(pending, mut carrier)| async move {
            if let Some(chunk) = pending {
                return Some((Ok::<_, std::io::Error>(chunk), (None, carrier)));
            }
            match carrier.read(chunk_size as i64).await {
                Ok(chunk) if chunk.is_empty() => None,
                Ok(chunk) => Some((Ok(chunk), (None, carrier))),
                Err(e) => Some((Err(std::io::Error::other(e.to_string())), (None, carrier))),
            }
        },
    ));

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_str(&adapted.media_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    for (name, value) in &adapted.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    Ok(response)
}
