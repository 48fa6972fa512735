//! HTTP front end
//!
//! Exposes the story service over REST, with the push stream served as
//! server-sent events. Choices travel out of band on their own route, so a
//! stream stays read-only.

use crate::application::api::{
    ApiError, ChoiceSubmission, ConnectRequest, ProgressCheckpoint, StatusReport,
};
use crate::application::service::StoryService;
use crate::domain::entities::{Story, StoryKind};
use crate::domain::value_objects::{OptionId, SeqId, StoryId, VersionId, ViewerId};
use crate::infrastructure::sse::encode_frame;
use crate::storage::StoryGraph;
use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::StreamExt;
use log::{error, info, warn};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

pub type AppState = Arc<StoryService>;

// --- Request bodies ---

#[derive(Deserialize)]
pub struct CreateStoryBody {
    story_id: StoryId,
    title: String,
    kind: StoryKind,
    creator: Option<ViewerId>,
}

#[derive(Deserialize)]
pub struct StreamQuery {
    viewer_id: ViewerId,
    from_seq_id: Option<SeqId>,
    version_id: Option<VersionId>,
}

#[derive(Deserialize)]
pub struct ChoiceBody {
    viewer_id: ViewerId,
    option_id: OptionId,
}

#[derive(Deserialize)]
pub struct ProgressBody {
    seq_id: SeqId,
    version_id: Option<VersionId>,
    chapter_id: Option<String>,
    scene_id: Option<String>,
    play_time_secs: Option<u64>,
}

// --- Errors ---

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Connection(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed: {self}");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        match self {
            ApiError::NotReady { retry_after_secs, .. } => {
                (status, [(header::RETRY_AFTER, retry_after_secs.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// --- Routes ---

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/stories", post(create_story))
        .route(
            "/api/stories/{id}",
            get(get_story).put(import_story).delete(remove_story),
        )
        .route("/api/stories/{id}/status", get(story_status))
        .route("/api/stories/{id}/graph", get(export_graph))
        .route("/api/stories/{id}/versions", get(story_versions))
        .route("/api/stories/{id}/stream", get(stream_story))
        .route("/api/stories/{id}/choices", post(submit_choice))
        .route(
            "/api/stories/{id}/progress/{viewer_id}",
            get(get_progress).put(save_progress).delete(delete_progress),
        )
        .with_state(service)
}

/// Bind `bind_address` and serve until the listener fails
pub async fn serve(service: AppState, bind_address: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!("storyweave listening on {}", listener.local_addr()?);
    axum::serve(listener, router(service)).await
}

// --- Handlers ---

async fn create_story(
    State(service): State<AppState>,
    Json(body): Json<CreateStoryBody>,
) -> ApiResult<impl IntoResponse> {
    let creator = body.creator.unwrap_or_else(|| ViewerId::from("anonymous"));
    let story = Story::new(body.story_id, body.title, body.kind, creator);
    let report = service.create_story(story).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

async fn import_story(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(graph): Json<StoryGraph>,
) -> ApiResult<impl IntoResponse> {
    if graph.story_id.as_str() != id {
        return Err(ApiError::invalid(format!(
            "graph of '{}' sent to '{id}'",
            graph.story_id
        )));
    }
    let report = service.import_story(graph.story(), graph.events).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn get_story(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Story>> {
    Ok(Json(service.story(&StoryId::from(id)).await?))
}

async fn remove_story(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    service.remove_story(&StoryId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn story_status(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusReport>> {
    Ok(Json(service.status(&StoryId::from(id)).await?))
}

async fn export_graph(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let story_id = StoryId::from(id);
    let story = service.story(&story_id).await?;
    let events = service.export_story(&story_id).await?;
    Ok(Json(StoryGraph {
        story_id,
        title: story.title,
        kind: story.kind,
        creator: Some(story.creator),
        events,
    }))
}

async fn story_versions(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.versions_of(&StoryId::from(id)).await?))
}

async fn stream_story(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StreamQuery>,
) -> ApiResult<Response> {
    let request = ConnectRequest {
        story_id: StoryId::from(id),
        viewer_id: params.viewer_id,
        from_seq_id: params.from_seq_id,
        version_id: params.version_id,
    };
    let connection = service.connect(request).await?;
    let frames = connection.into_stream().filter_map(|frame| async move {
        match encode_frame(&frame) {
            Ok(text) => Some(Ok::<_, Infallible>(text)),
            Err(e) => {
                error!("Dropping unencodable frame: {e}");
                None
            }
        }
    });
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn submit_choice(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChoiceBody>,
) -> ApiResult<impl IntoResponse> {
    let ack = service
        .submit_choice(ChoiceSubmission {
            story_id: StoryId::from(id),
            viewer_id: body.viewer_id,
            option_id: body.option_id,
        })
        .await?;
    Ok(Json(ack))
}

async fn get_progress(
    State(service): State<AppState>,
    Path((id, viewer_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let progress = service
        .get_progress(&ViewerId::from(viewer_id), &StoryId::from(id))
        .await?;
    Ok(Json(progress))
}

async fn save_progress(
    State(service): State<AppState>,
    Path((id, viewer_id)): Path<(String, String)>,
    Json(body): Json<ProgressBody>,
) -> ApiResult<StatusCode> {
    service
        .save_progress(ProgressCheckpoint {
            story_id: StoryId::from(id),
            viewer_id: ViewerId::from(viewer_id),
            seq_id: body.seq_id,
            version_id: body.version_id,
            chapter_id: body.chapter_id,
            scene_id: body.scene_id,
            play_time_secs: body.play_time_secs,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_progress(
    State(service): State<AppState>,
    Path((id, viewer_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let removed = service
        .delete_progress(&ViewerId::from(viewer_id), &StoryId::from(id))
        .await?;
    Ok(if removed { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_http_statuses() {
        assert_eq!(ApiError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::invalid("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::internal("x").status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let busy = ApiError::NotReady {
            message: "preparing".into(),
            retry_after_secs: 2,
        }
        .into_response();
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(busy.headers()[header::RETRY_AFTER], "2");
    }
}
