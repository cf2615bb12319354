use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use typerace_shared::{
    passages::Passage,
    protocol::ErrorCode,
    types::{
        Difficulty, RaceId, RaceResult, RaceResultSet, RoomSettings, RoomView, UserId, CATEGORIES,
    },
};

use crate::{
    error::RoomError, registry::RoomRegistry, results::SubmitOutcome, room::UserRef, AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct CreateRoomBody {
    #[serde(default)]
    pub settings: RoomSettings,
    /// Joins the creator straight away when given.
    pub host: Option<UserRef>,
}

#[derive(Debug, Deserialize)]
pub struct LeaveBody {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct SettingsBody {
    pub user_id: UserId,
    pub settings: RoomSettings,
}

#[derive(Debug, Deserialize)]
pub struct SubmitResultsBody {
    /// Defaults to the room's current race.
    pub race_id: Option<RaceId>,
    pub results: Vec<RaceResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Rejection {
    pub user_id: UserId,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: Vec<UserId>,
    pub duplicates: Vec<UserId>,
    pub rejected: Vec<Rejection>,
    /// The race was already committed; `results` is the authoritative set.
    pub stale: bool,
    pub results: Option<RaceResultSet>,
}

#[derive(Debug, Deserialize)]
pub struct PassageQuery {
    pub difficulty: Option<Difficulty>,
    pub category: Option<String>,
}

pub async fn create_room(
    State(state): State<AppState>,
    body: Option<Json<CreateRoomBody>>,
) -> Result<(StatusCode, Json<RoomView>), RoomError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let room = state.registry.create_room(body.settings)?;
    let view = match body.host {
        Some(host) => state.registry.join(room.code(), host, None).await?.1,
        None => room.view().await,
    };
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<RoomView>, RoomError> {
    let code = RoomRegistry::parse_code(&code)?;
    Ok(Json(state.registry.get(&code)?.view().await))
}

pub async fn join_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(user): Json<UserRef>,
) -> Result<Json<RoomView>, RoomError> {
    let code = RoomRegistry::parse_code(&code)?;
    let (_, view) = state.registry.join(&code, user, None).await?;
    Ok(Json(view))
}

pub async fn leave_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(body): Json<LeaveBody>,
) -> Result<StatusCode, RoomError> {
    let code = RoomRegistry::parse_code(&code)?;
    state.registry.leave(&code, &body.user_id, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_settings(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(body): Json<SettingsBody>,
) -> Result<Json<RoomView>, RoomError> {
    let code = RoomRegistry::parse_code(&code)?;
    let view = state
        .registry
        .update_settings(&code, &body.user_id, body.settings)
        .await?;
    Ok(Json(view))
}

pub async fn get_results(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<RaceResultSet>, RoomError> {
    let code = RoomRegistry::parse_code(&code)?;
    let set = state.registry.results(&code)?;
    Ok(Json((*set).clone()))
}

/// Client-reported results. Each entry is judged on its own; the response
/// says which were taken, which were ignored and why.
pub async fn submit_results(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(body): Json<SubmitResultsBody>,
) -> Result<Json<SubmitResponse>, RoomError> {
    let code = RoomRegistry::parse_code(&code)?;
    let room = state.registry.get(&code)?;

    let mut response = SubmitResponse::default();
    for result in body.results {
        let user_id = result.user_id.clone();
        match room.submit_result(body.race_id.clone(), result).await {
            Ok(SubmitOutcome::Accepted) => response.accepted.push(user_id),
            Ok(SubmitOutcome::Duplicate) => response.duplicates.push(user_id),
            Ok(SubmitOutcome::Stale(set)) => {
                response.stale = true;
                response.results = Some((*set).clone());
            }
            Err(e) => {
                debug!(room = %code, user = %user_id, "result rejected: {e}");
                response.rejected.push(Rejection {
                    user_id,
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }
    if response.results.is_none() {
        response.results = state.registry.results(&code).ok().map(|set| (*set).clone());
    }

    info!(
        room = %code,
        accepted = response.accepted.len(),
        rejected = response.rejected.len(),
        "results submitted"
    );
    Ok(Json(response))
}

pub async fn get_passage(
    State(state): State<AppState>,
    Query(query): Query<PassageQuery>,
) -> Result<Json<Passage>, RoomError> {
    let category = match query.category.as_deref() {
        None | Some("random") => None,
        Some(category) if CATEGORIES.contains(&category) => Some(category),
        Some(other) => {
            return Err(RoomError::InvalidSettings(format!("unknown category `{other}`")))
        }
    };
    let difficulty = query.difficulty.unwrap_or_default();
    let passage = state
        .registry
        .context()
        .passages
        .passage(difficulty, category)
        .await;
    Ok(Json(passage))
}
