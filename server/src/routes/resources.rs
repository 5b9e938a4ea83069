//! Resource endpoints.
//!
//! Creates are upserts, so a client replaying a create it already delivered
//! leaves a single record behind.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use depot_engine::record_key;
use depot_engine::remote::wire::is_valid_resource_name;
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::AppState;

/// Create resource routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/resources/{resource}",
            get(list_records).post(create_record),
        )
        .route(
            "/resources/{resource}/{key}",
            put(update_record).delete(delete_record),
        )
}

fn check_resource(resource: &str) -> Result<()> {
    if is_valid_resource_name(resource) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "invalid resource name '{resource}'"
        )))
    }
}

fn into_object(body: Value) -> Result<Map<String, Value>> {
    match body {
        Value::Object(fields) => Ok(fields),
        _ => Err(AppError::Unprocessable(
            "record must be a JSON object".to_string(),
        )),
    }
}

/// GET /resources/{resource} - All records, oldest first.
async fn list_records(
    State(state): State<AppState>,
    Path(resource): Path<String>,
) -> Result<Json<Vec<Value>>> {
    check_resource(&resource)?;
    let records = state.repo.list(&resource).await?;
    Ok(Json(records))
}

/// POST /resources/{resource} - Insert or replace a record by its key.
async fn create_record(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    check_resource(&resource)?;
    let key_field = &state.config.key_field;
    let key = record_key(&body, key_field).ok_or_else(|| {
        AppError::Unprocessable(format!("record has no usable '{key_field}' field"))
    })?;
    let record = into_object(body)?;

    let stored = state.repo.upsert(&resource, &key, &record).await?;
    tracing::debug!(resource = %resource, key = %key, "Record upserted");
    Ok((StatusCode::CREATED, Json(stored)))
}

/// PUT /resources/{resource}/{key} - Shallow-merge fields into a record.
async fn update_record(
    State(state): State<AppState>,
    Path((resource, key)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    check_resource(&resource)?;
    let mut patch = into_object(body)?;
    // The key comes from the path; a record cannot be re-keyed.
    patch.remove(&state.config.key_field);

    match state.repo.merge(&resource, &key, &patch).await? {
        Some(merged) => {
            tracing::debug!(resource = %resource, key = %key, "Record updated");
            Ok(Json(merged))
        }
        None => Err(AppError::NotFound(format!("{resource}/{key}"))),
    }
}

/// DELETE /resources/{resource}/{key} - Delete a record; absent is fine.
async fn delete_record(
    State(state): State<AppState>,
    Path((resource, key)): Path<(String, String)>,
) -> Result<StatusCode> {
    check_resource(&resource)?;
    let existed = state.repo.delete(&resource, &key).await?;
    tracing::debug!(resource = %resource, key = %key, existed, "Record deleted");
    Ok(StatusCode::NO_CONTENT)
}
