use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use typerace_shared::{
    protocol::{ClientMsg, Envelope, ErrorCode, ServerMsg},
    types::UserId,
};
use uuid::Uuid;

use crate::{
    error::RoomError,
    registry::RoomRegistry,
    room::{ConnectionId, Room, UserRef},
    AppState,
};

/// The room a socket has joined and the identity it joined as.
struct Session {
    room: Arc<Room>,
    user_id: UserId,
    rx: broadcast::Receiver<Envelope>,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<RoomRegistry>) {
    let (mut sender, mut receiver) = socket.split();
    let connection: ConnectionId = Uuid::new_v4();
    let mut session: Option<Session> = None;

    info!(%connection, "websocket connected");

    'socket: loop {
        tokio::select! {
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(%connection, "received {text}");
                        let replies = match serde_json::from_str::<ClientMsg>(&text) {
                            Ok(msg) => dispatch(&registry, &mut session, connection, msg).await,
                            Err(e) => vec![ServerMsg::Rejected {
                                code: ErrorCode::BadMessage,
                                message: e.to_string(),
                            }],
                        };
                        for reply in &replies {
                            if send_json(&mut sender, reply).await.is_err() {
                                break 'socket;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }

            room_msg = async {
                match session.as_mut() {
                    Some(session) => session.rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match room_msg {
                    Ok(envelope) => {
                        if send_json(&mut sender, &envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%connection, skipped, "subscriber lagged; resending room state");
                        if let Some(session) = &session {
                            let snapshot = ServerMsg::RoomState {
                                room: session.room.view().await,
                            };
                            if send_json(&mut sender, &snapshot).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!(%connection, "room channel closed");
                        session = None;
                    }
                }
            }
        }
    }

    if let Some(session) = session {
        match registry
            .leave(session.room.code(), &session.user_id, Some(connection))
            .await
        {
            Ok(true) => info!(room = %session.room.code(), user = %session.user_id, "player disconnected"),
            Ok(false) => debug!(user = %session.user_id, "stale connection closed"),
            Err(e) => debug!(user = %session.user_id, "disconnect cleanup: {e}"),
        }
    }
    info!(%connection, "websocket closed");
}

/// Applies one client message. Failures become a `rejected` reply to this
/// socket only.
async fn dispatch(
    registry: &RoomRegistry,
    session: &mut Option<Session>,
    connection: ConnectionId,
    msg: ClientMsg,
) -> Vec<ServerMsg> {
    match apply(registry, session, connection, msg).await {
        Ok(replies) => replies,
        Err(e) => {
            debug!(%connection, "rejected: {e}");
            vec![e.to_rejection()]
        }
    }
}

async fn apply(
    registry: &RoomRegistry,
    session: &mut Option<Session>,
    connection: ConnectionId,
    msg: ClientMsg,
) -> Result<Vec<ServerMsg>, RoomError> {
    let now = Instant::now();
    let command = match msg {
        ClientMsg::Join {
            room,
            user_id,
            username,
        } => {
            let user = UserRef { user_id, username };
            return join(registry, session, connection, &room, user, now).await;
        }
        command => command,
    };

    let Some(current) = session.as_ref() else {
        return Err(RoomError::NotMember);
    };
    let room = current.room.clone();
    let user_id = current.user_id.clone();

    match command {
        ClientMsg::Leave => {
            registry
                .leave(room.code(), &user_id, Some(connection))
                .await?;
            *session = None;
        }
        ClientMsg::Ready { ready } => {
            room.set_ready(&user_id, ready).await?;
        }
        ClientMsg::SettingsUpdate { settings } => {
            room.update_settings(&user_id, settings).await?;
        }
        ClientMsg::Start => {
            room.start(&user_id, now).await?;
        }
        ClientMsg::Key { key } => {
            room.keystroke(&user_id, key, now).await?;
        }
        ClientMsg::Reset => {
            room.reset(&user_id).await?;
        }
        ClientMsg::Join { .. } => {}
    }
    Ok(Vec::new())
}

async fn join(
    registry: &RoomRegistry,
    session: &mut Option<Session>,
    connection: ConnectionId,
    raw_code: &str,
    user: UserRef,
    now: Instant,
) -> Result<Vec<ServerMsg>, RoomError> {
    let code = RoomRegistry::parse_code(raw_code)?;

    // Subscribe first so nothing published after the snapshot is missed.
    let target = registry.create_or_get(&code);
    let mut rx = target.subscribe();
    let user_id = user.user_id.clone();
    let (room, view) = registry.join(&code, user, Some(connection)).await?;
    if !Arc::ptr_eq(&room, &target) {
        rx = room.subscribe();
    }

    // The socket keeps its current session until the new room admits it.
    if let Some(old) = session.take() {
        if old.user_id != user_id {
            let _ = registry
                .leave(old.room.code(), &old.user_id, Some(connection))
                .await;
        }
    }

    let mut replies = vec![ServerMsg::RoomState { room: view }];
    replies.extend(room.resume_messages(&user_id, now).await);
    info!(room = %code, user = %user_id, %connection, "socket joined room");
    *session = Some(Session { room, user_id, rx });
    Ok(replies)
}

async fn send_json<T: Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &T,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(e) => {
            error!("failed to encode outgoing message: {e}");
            Ok(())
        }
    }
}
