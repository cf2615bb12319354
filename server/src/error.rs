use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use typerace_shared::{
    fsm::{RoomEvent, RoomStatus},
    protocol::{ErrorCode, ServerMsg},
};

/// Recoverable failures of room operations. None of them alter room state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoomError {
    #[error("room {0} not found")]
    NotFound(String),
    #[error("`{0}` is not a valid room code")]
    InvalidRoomCode(String),
    #[error("room is full")]
    RoomFull,
    #[error("a race is already under way in this room")]
    RoomInProgress,
    #[error("only the host can do that")]
    NotHost,
    #[error("not every player is ready")]
    NotReady,
    #[error("not a member of this room")]
    NotMember,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("cannot apply {event} while room is {from}")]
    InvalidTransition { from: RoomStatus, event: RoomEvent },
    #[error("invalid keystroke: {0}")]
    InvalidKeystroke(String),
    #[error("implausible result: {0}")]
    ImplausibleResult(String),
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::NotFound(_) => ErrorCode::NotFound,
            RoomError::InvalidRoomCode(_) => ErrorCode::InvalidRoomCode,
            RoomError::RoomFull => ErrorCode::RoomFull,
            RoomError::RoomInProgress => ErrorCode::RoomInProgress,
            RoomError::NotHost => ErrorCode::NotHost,
            RoomError::NotReady => ErrorCode::NotReady,
            RoomError::NotMember => ErrorCode::NotMember,
            RoomError::InvalidSettings(_) => ErrorCode::InvalidSettings,
            RoomError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            RoomError::InvalidKeystroke(_) => ErrorCode::InvalidKeystroke,
            RoomError::ImplausibleResult(_) => ErrorCode::ImplausibleResult,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RoomError::NotFound(_) => StatusCode::NOT_FOUND,
            RoomError::RoomFull
            | RoomError::RoomInProgress
            | RoomError::NotReady
            | RoomError::InvalidTransition { .. } => StatusCode::CONFLICT,
            RoomError::NotHost | RoomError::NotMember => StatusCode::FORBIDDEN,
            RoomError::InvalidRoomCode(_)
            | RoomError::InvalidSettings(_)
            | RoomError::InvalidKeystroke(_)
            | RoomError::ImplausibleResult(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Rejection sent back to the socket that issued the failed request.
    pub fn to_rejection(&self) -> ServerMsg {
        ServerMsg::Rejected {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
