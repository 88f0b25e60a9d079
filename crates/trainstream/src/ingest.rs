//! Ingest HTTP frontend.
//!
//! Two per-application endpoints: batch upload and manual retrain. Responses
//! are the plain-text bodies the platform's clients expect.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tracing::{error, info};

use trainstream_store::RedisStore;

use crate::processor::DataProcessor;
use crate::util::current_time_micros;

#[derive(Clone)]
pub struct IngestState {
    store: Arc<RedisStore>,
    processor: Arc<DataProcessor>,
}

/// Build the ingest router.
pub fn router(store: Arc<RedisStore>, processor: Arc<DataProcessor>) -> Router {
    Router::new()
        .route("/:app/upload", post(upload))
        .route("/:app/retrain", post(retrain))
        .with_state(IngestState { store, processor })
}

/// Upload body: `{"data": [[f64, …], …]}`, one inner array per sample.
#[derive(Debug, Deserialize)]
struct UploadRequest {
    data: Vec<Vec<f64>>,
}

async fn upload(
    State(state): State<IngestState>,
    Path(app): Path<String>,
    body: String,
) -> Response {
    let Ok(request) = serde_json::from_str::<UploadRequest>(&body) else {
        return (StatusCode::BAD_REQUEST, "Malformed upload request\n").into_response();
    };

    match run_store(&state, {
        let app = app.clone();
        move |store| store.application_exists(&app)
    })
    .await
    {
        Some(true) => {}
        Some(false) => {
            return (StatusCode::NOT_FOUND, "Unknown application\n").into_response();
        }
        None => return upload_response(false),
    }

    let arrival_us = current_time_micros();
    let sample_count = request.data.len() as i64;

    // Persist the raw batch before the trigger sees it, so a triggered
    // retrain can always resolve the window back to data ids.
    let persisted = run_store(&state, {
        let app = app.clone();
        move |store| {
            let data_id = store.add_retrain_data(arrival_us, &request.data)?;
            store.add_app_data_link(&app, arrival_us, &data_id)
        }
    })
    .await
    .is_some();
    if !persisted {
        return upload_response(false);
    }

    info!("Received data upload. app:{app} samples:{sample_count}");
    let accepted = state
        .processor
        .update_retrain_trigger_data(&app, arrival_us, sample_count)
        .await
        .unwrap_or(false);
    upload_response(accepted)
}

async fn retrain(State(state): State<IngestState>, Path(app): Path<String>) -> Response {
    let data_size = state.processor.manual_retrain(&app).await.unwrap_or(-1);
    (
        StatusCode::OK,
        format!("Retrain data size : {data_size}\n"),
    )
        .into_response()
}

fn upload_response(accepted: bool) -> Response {
    (
        StatusCode::OK,
        format!("Upload received? {}\n", accepted as i32),
    )
        .into_response()
}

/// Run a blocking store operation off the HTTP worker; errors are logged and
/// collapse to `None`.
async fn run_store<T, F>(state: &IngestState, op: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(&RedisStore) -> trainstream_store::StoreResult<T> + Send + 'static,
{
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || op(&store)).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!("Store operation failed: {e}");
            None
        }
        Err(e) => {
            error!("Store task panicked: {e}");
            None
        }
    }
}
