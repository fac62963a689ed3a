//! Tenant-scoped CRUD and subscription operation handlers.

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use lumen_core::resource_type;
use lumen_subscriptions::{ContentLevel, SubscriptionEngine, is_topic_document};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// `POST /{tenant}/{resourceType}`
///
/// Topic documents register with the topic registry, Subscription resources
/// go through engine validation, everything else lands in the store.
pub async fn create_resource(
    State(state): State<AppState>,
    Path((tenant, rtype)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let engine = state.engine(&tenant)?;

    let body_type = resource_type(&body)
        .ok_or_else(|| ApiError::BadRequest("resource is missing resourceType".into()))?;
    if body_type != rtype {
        return Err(ApiError::BadRequest(format!(
            "resourceType mismatch: body says {body_type}, path says {rtype}"
        )));
    }

    if rtype == "Subscription" {
        let stored = engine.create_subscription(&body).await?;
        return Ok((StatusCode::CREATED, Json(stored)));
    }

    if is_topic_document(&body) {
        engine.load_topic(&body)?;
    }

    let stored = engine.store().create(body).await?;
    Ok((StatusCode::CREATED, Json(stored.resource)))
}

/// `GET /{tenant}/{resourceType}/{id}`
pub async fn read_resource(
    State(state): State<AppState>,
    Path((tenant, rtype, id)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine(&tenant)?;

    if rtype == "Subscription" {
        return Ok(Json(engine.subscription_resource(&id)?));
    }

    let stored = engine
        .store()
        .read(&rtype, &id)?
        .ok_or_else(|| ApiError::NotFound(format!("{rtype}/{id} not found")))?;
    Ok(Json(stored.resource))
}

/// `PUT /{tenant}/{resourceType}/{id}`
pub async fn update_resource(
    State(state): State<AppState>,
    Path((tenant, rtype, id)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine(&tenant)?;

    if rtype == "Subscription" {
        return Ok(Json(engine.update_subscription(&id, &body)?));
    }

    if is_topic_document(&body) {
        engine.load_topic(&body)?;
    }

    let stored = engine.store().update(&rtype, &id, body).await?;
    Ok(Json(stored.resource))
}

/// `DELETE /{tenant}/{resourceType}/{id}`
pub async fn delete_resource(
    State(state): State<AppState>,
    Path((tenant, rtype, id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let engine = state.engine(&tenant)?;

    if rtype == "Subscription" {
        engine.delete_subscription(&id)?;
        return Ok(StatusCode::NO_CONTENT);
    }

    engine.store().delete(&rtype, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /{tenant}/Subscription/{id}/$status`
pub async fn subscription_status(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine(&tenant)?;
    Ok(Json(engine.status_bundle(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    content: Option<String>,
    #[serde(rename = "eventsSinceNumber")]
    events_since_number: Option<u64>,
    #[serde(rename = "eventsUntilNumber")]
    events_until_number: Option<u64>,
}

/// `GET /{tenant}/Subscription/{id}/$events`
///
/// Plain requests get a `query-event` bundle synthesized from the log; a
/// WebSocket upgrade attaches the connection to the push channel instead.
pub async fn subscription_events(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiError> {
    let engine = state.engine(&tenant)?;

    // Either path starts by confirming the subscription exists.
    engine.status(&id)?;

    if let Some(ws) = ws {
        let response = ws.on_upgrade(move |socket| websocket_session(engine, id, socket));
        return Ok(response);
    }

    let content = query
        .content
        .as_deref()
        .map(|value| {
            ContentLevel::parse(value)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown content level '{value}'")))
        })
        .transpose()?;

    let bundle = engine.events_bundle(
        &id,
        query.events_since_number,
        query.events_until_number,
        content,
    )?;
    Ok(Json(bundle).into_response())
}

/// Forward dispatched payloads to a connected WebSocket client until either
/// side closes.
async fn websocket_session(engine: Arc<SubscriptionEngine>, subscription_id: String, mut socket: WebSocket) {
    let registry = engine.websockets();
    let mut payloads = registry.register(&subscription_id, 32);
    tracing::debug!(id = %subscription_id, "WebSocket client attached");

    loop {
        tokio::select! {
            payload = payloads.recv() => {
                let Some(payload) = payload else {
                    break;
                };
                if socket.send(Message::Binary(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Inbound frames are ignored; the channel is push-only.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    registry.prune(&subscription_id);
    tracing::debug!(id = %subscription_id, "WebSocket client detached");
}
