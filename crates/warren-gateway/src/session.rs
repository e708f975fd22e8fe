use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::task::spawn_blocking;
use tracing::{error, info, warn};
use uuid::Uuid;

use warren_db::{Database, StoreError};
use warren_types::events::{GatewayCommand, GatewayEvent};
use warren_types::models::{DeliveryStatus, PresenceStatus};

use crate::dispatcher::Dispatcher;

/// Identity and per-connection state of one authenticated session.
/// `count` is the monotonically increasing counter echoed in every
/// acknowledgement and broadcast this connection originates.
pub struct Session {
    pub conn_id: Uuid,
    pub user_id: i64,
    pub username: String,
    pub count: u64,
}

/// Drives one WebSocket from connect to disconnect.
///
/// Lifecycle: banner, authenticate gate, then a send task fed by the
/// dispatcher channel and a receive loop processing commands in
/// arrival order. Whatever way the connection ends, the dispatcher
/// detach and the presence write run exactly once.
pub async fn handle_socket(socket: WebSocket, db: Arc<Database>, dispatcher: Dispatcher) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    let banner = GatewayEvent::ServerResponse {
        data: "Connected".into(),
        count: 0,
    };
    if send_direct(&mut sender, &banner).await.is_err() {
        return;
    }

    // Nothing is trusted before an explicit authenticate.
    let (user_id, username) = match wait_for_authenticate(&mut sender, &mut receiver, &db).await {
        Some(identity) => identity,
        None => return,
    };

    let mut conn_rx = match dispatcher.attach(conn_id, user_id) {
        Ok(rx) => rx,
        Err(e) => {
            error!("session {} failed to register: {}", conn_id, e);
            return;
        }
    };

    set_presence(&db, user_id, PresenceStatus::Available).await;
    info!("{} ({}) connected as session {}", username, user_id, conn_id);

    // Outbound: everything the dispatcher enqueues for this connection.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = conn_rx.recv().await {
            if send_direct(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    let recv_dispatcher = dispatcher.clone();
    let recv_db = db.clone();
    let mut session = Session {
        conn_id,
        user_id,
        username: username.clone(),
        count: 0,
    };
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        if !handle_command(&recv_dispatcher, &recv_db, &mut session, cmd).await {
                            break;
                        }
                    }
                    Err(e) => {
                        let raw = text.as_str().get(..200).unwrap_or(text.as_str());
                        warn!("session {} bad frame: {} (raw: {})", session.conn_id, e, raw);
                        recv_dispatcher.send_to_conn(
                            session.conn_id,
                            GatewayEvent::error_with("bad_request", "unrecognized event"),
                        );
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Mandatory finalizer: runs for every exit path, graceful or not.
    dispatcher.detach(conn_id);
    set_presence(&db, user_id, PresenceStatus::Offline).await;
    info!("{} ({}) disconnected (session {})", username, user_id, conn_id);
}

/// Processes one command for an authenticated session. Returns `false`
/// when the connection should close.
pub async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    session: &mut Session,
    cmd: GatewayCommand,
) -> bool {
    match cmd {
        GatewayCommand::Authenticate { .. } => {
            dispatcher.send_to_conn(
                session.conn_id,
                GatewayEvent::error_with("bad_request", "already authenticated"),
            );
        }

        GatewayCommand::Join { room } => {
            dispatcher.registry().join(session.conn_id, &room);
            ack_rooms(dispatcher, session);
        }

        GatewayCommand::Leave { room } => {
            dispatcher.registry().leave(session.conn_id, &room);
            ack_rooms(dispatcher, session);
        }

        GatewayCommand::RoomMessage { room, message } => {
            if !dispatcher.registry().is_member(session.conn_id, &room) {
                dispatcher.send_to_conn(
                    session.conn_id,
                    GatewayEvent::error_with("forbidden", "not a member of that room"),
                );
                return true;
            }
            session.count += 1;
            dispatcher.broadcast_room(
                &room,
                GatewayEvent::ServerResponse {
                    data: message,
                    count: session.count,
                },
            );
        }

        GatewayCommand::Typing { room } => {
            if !dispatcher.registry().is_member(session.conn_id, &room) {
                dispatcher.send_to_conn(
                    session.conn_id,
                    GatewayEvent::error_with("forbidden", "not a member of that room"),
                );
                return true;
            }
            dispatcher.broadcast_room_except(
                &room,
                session.conn_id,
                GatewayEvent::Typing {
                    room: room.clone(),
                    username: session.username.clone(),
                },
            );
        }

        GatewayCommand::DirectMessage { to, message } => {
            handle_direct_message(dispatcher, db, session, to, message).await;
        }

        GatewayCommand::DisconnectRequest {} => {
            session.count += 1;
            dispatcher.send_to_conn(
                session.conn_id,
                GatewayEvent::ServerResponse {
                    data: "Disconnected!".into(),
                    count: session.count,
                },
            );
            return false;
        }
    }

    true
}

/// Persist-then-push. The row is durable at `Sent` before any delivery
/// attempt; a live recipient advances it to `Received`, an offline one
/// picks it up later through the REST history endpoint.
async fn handle_direct_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    session: &mut Session,
    to: String,
    message: String,
) {
    let result = {
        let db = db.clone();
        let sender_id = session.user_id;
        spawn_blocking(move || {
            let recipient = db.get_user_by_username(&to)?.ok_or(StoreError::NotFound)?;
            let row = db.append_message(sender_id, recipient.id, &message)?;
            Ok::<_, StoreError>((recipient.id, row))
        })
        .await
    };

    let (recipient_id, row) = match result {
        Ok(Ok(pair)) => pair,
        Ok(Err(StoreError::NotFound)) => {
            dispatcher.send_to_conn(
                session.conn_id,
                GatewayEvent::error_with("not_found", "no such user"),
            );
            return;
        }
        Ok(Err(StoreError::Validation(detail))) => {
            dispatcher.send_to_conn(
                session.conn_id,
                GatewayEvent::error_with("validation", detail),
            );
            return;
        }
        Ok(Err(e)) => {
            error!("direct message persist failed: {}", e);
            dispatcher.send_to_conn(session.conn_id, GatewayEvent::error("internal"));
            return;
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            dispatcher.send_to_conn(session.conn_id, GatewayEvent::error("internal"));
            return;
        }
    };

    let mut status = DeliveryStatus::Sent;
    let event = GatewayEvent::DirectMessage {
        id: row.id,
        from: session.username.clone(),
        body: row.body.clone(),
        sent_at: row.sent_at,
        delivery_status: status,
    };

    if dispatcher.send_to_user(recipient_id, event) {
        let db = db.clone();
        let message_id = row.id;
        match spawn_blocking(move || db.set_delivery_status(message_id, DeliveryStatus::Received))
            .await
        {
            Ok(Ok(_)) => status = DeliveryStatus::Received,
            Ok(Err(e)) => error!("delivery advance failed for message {}: {}", message_id, e),
            Err(e) => error!("spawn_blocking join error: {}", e),
        }
    }

    // Echo to the sender so the client learns the id and final status.
    dispatcher.send_to_conn(
        session.conn_id,
        GatewayEvent::DirectMessage {
            id: row.id,
            from: session.username.clone(),
            body: row.body,
            sent_at: row.sent_at,
            delivery_status: status,
        },
    );
}

fn ack_rooms(dispatcher: &Dispatcher, session: &mut Session) {
    let mut rooms: Vec<String> = dispatcher
        .registry()
        .rooms_of(session.conn_id)
        .into_iter()
        .collect();
    rooms.sort();

    session.count += 1;
    dispatcher.send_to_conn(
        session.conn_id,
        GatewayEvent::ServerResponse {
            data: format!("In rooms: {}", rooms.join(", ")),
            count: session.count,
        },
    );
}

async fn wait_for_authenticate(
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    db: &Arc<Database>,
) -> Option<(i64, String)> {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };

        match serde_json::from_str::<GatewayCommand>(&text) {
            Ok(GatewayCommand::Authenticate { token }) => {
                let db = db.clone();
                let verified = spawn_blocking(move || db.verify_token(&token)).await;
                match verified {
                    Ok(Ok(user)) => return Some((user.id, user.username)),
                    Ok(Err(_)) => {
                        if send_direct(sender, &GatewayEvent::error("authentication failed"))
                            .await
                            .is_err()
                        {
                            return None;
                        }
                    }
                    Err(e) => {
                        error!("spawn_blocking join error: {}", e);
                        return None;
                    }
                }
            }
            Ok(_) => {
                // Anything but authenticate is rejected, not processed.
                if send_direct(sender, &GatewayEvent::error("unauthenticated"))
                    .await
                    .is_err()
                {
                    return None;
                }
            }
            Err(_) => {
                if send_direct(
                    sender,
                    &GatewayEvent::error_with("bad_request", "unrecognized event"),
                )
                .await
                .is_err()
                {
                    return None;
                }
            }
        }
    }
    None
}

async fn send_direct(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &GatewayEvent,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).unwrap();
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn set_presence(db: &Arc<Database>, user_id: i64, status: PresenceStatus) {
    let db = db.clone();
    match spawn_blocking(move || db.set_presence(user_id, status.as_i64())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("presence update failed for user {}: {}", user_id, e),
        Err(e) => error!("spawn_blocking join error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_db() -> Arc<Database> {
        Arc::new(Database::open_in_memory().unwrap())
    }

    fn attach_session(
        dispatcher: &Dispatcher,
        user_id: i64,
        username: &str,
    ) -> (Session, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let rx = dispatcher.attach(conn_id, user_id).unwrap();
        (
            Session {
                conn_id,
                user_id,
                username: username.to_string(),
                count: 0,
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn join_acks_with_room_list_to_requester_only() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (mut alice, mut alice_rx) = attach_session(&dispatcher, 1, "alice");
        let (_bob, mut bob_rx) = attach_session(&dispatcher, 2, "bob");

        for room in ["general", "crafts"] {
            let keep = handle_command(
                &dispatcher,
                &db,
                &mut alice,
                GatewayCommand::Join { room: room.into() },
            )
            .await;
            assert!(keep);
        }

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 2);
        match &events[1] {
            GatewayEvent::ServerResponse { data, count } => {
                assert_eq!(data, "In rooms: crafts, general");
                assert_eq!(*count, 2);
            }
            other => panic!("expected server_response, got {:?}", other),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn room_message_reaches_all_members_including_sender() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (mut alice, mut alice_rx) = attach_session(&dispatcher, 1, "alice");
        let (mut bob, mut bob_rx) = attach_session(&dispatcher, 2, "bob");
        let (mut carol, mut carol_rx) = attach_session(&dispatcher, 3, "carol");

        for session in [&mut alice, &mut bob, &mut carol] {
            handle_command(
                &dispatcher,
                &db,
                session,
                GatewayCommand::Join {
                    room: "general".into(),
                },
            )
            .await;
        }
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        drain(&mut carol_rx);

        handle_command(
            &dispatcher,
            &db,
            &mut alice,
            GatewayCommand::RoomMessage {
                room: "general".into(),
                message: "hello".into(),
            },
        )
        .await;

        for rx in [&mut alice_rx, &mut bob_rx, &mut carol_rx] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            assert!(matches!(
                &events[0],
                GatewayEvent::ServerResponse { data, .. } if data == "hello"
            ));
        }
    }

    #[tokio::test]
    async fn room_message_requires_membership() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (mut alice, mut alice_rx) = attach_session(&dispatcher, 1, "alice");
        let (mut bob, mut bob_rx) = attach_session(&dispatcher, 2, "bob");

        handle_command(
            &dispatcher,
            &db,
            &mut bob,
            GatewayCommand::Join {
                room: "general".into(),
            },
        )
        .await;
        drain(&mut bob_rx);

        handle_command(
            &dispatcher,
            &db,
            &mut alice,
            GatewayCommand::RoomMessage {
                room: "general".into(),
                message: "sneaky".into(),
            },
        )
        .await;

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], GatewayEvent::Error { error, .. } if error == "forbidden"));
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn typing_excludes_the_sender() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (mut alice, mut alice_rx) = attach_session(&dispatcher, 1, "alice");
        let (mut bob, mut bob_rx) = attach_session(&dispatcher, 2, "bob");

        for session in [&mut alice, &mut bob] {
            handle_command(
                &dispatcher,
                &db,
                session,
                GatewayCommand::Join {
                    room: "general".into(),
                },
            )
            .await;
        }
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        handle_command(
            &dispatcher,
            &db,
            &mut alice,
            GatewayCommand::Typing {
                room: "general".into(),
            },
        )
        .await;

        assert!(drain(&mut alice_rx).is_empty());
        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            GatewayEvent::Typing { room, username } if room == "general" && username == "alice"
        ));
    }

    #[tokio::test]
    async fn direct_message_to_live_recipient_advances_to_received() {
        let db = test_db();
        let alice = db
            .create_user("alice", "alice@example.com", "x", None, None)
            .unwrap();
        let bob = db
            .create_user("bob", "bob@example.com", "x", None, None)
            .unwrap();

        let dispatcher = Dispatcher::new();
        let (mut alice_session, mut alice_rx) = attach_session(&dispatcher, alice.id, "alice");
        let (_bob_session, mut bob_rx) = attach_session(&dispatcher, bob.id, "bob");

        handle_command(
            &dispatcher,
            &db,
            &mut alice_session,
            GatewayCommand::DirectMessage {
                to: "bob".into(),
                message: "hi".into(),
            },
        )
        .await;

        // Bob got the live push.
        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        let message_id = match &events[0] {
            GatewayEvent::DirectMessage { id, from, body, .. } => {
                assert_eq!(from, "alice");
                assert_eq!(body, "hi");
                *id
            }
            other => panic!("expected direct_message, got {:?}", other),
        };

        // The row advanced once the push was enqueued.
        let row = db.get_message(message_id).unwrap().unwrap();
        assert_eq!(row.delivery_status, DeliveryStatus::Received.as_i64());

        // Sender's echo carries the final status.
        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            GatewayEvent::DirectMessage { delivery_status, .. }
                if *delivery_status == DeliveryStatus::Received
        ));
    }

    #[tokio::test]
    async fn direct_message_to_offline_recipient_stays_sent() {
        let db = test_db();
        let alice = db
            .create_user("alice", "alice@example.com", "x", None, None)
            .unwrap();
        db.create_user("bob", "bob@example.com", "x", None, None)
            .unwrap();

        let dispatcher = Dispatcher::new();
        let (mut alice_session, mut alice_rx) = attach_session(&dispatcher, alice.id, "alice");

        handle_command(
            &dispatcher,
            &db,
            &mut alice_session,
            GatewayCommand::DirectMessage {
                to: "bob".into(),
                message: "hi".into(),
            },
        )
        .await;

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        let message_id = match &events[0] {
            GatewayEvent::DirectMessage {
                id,
                delivery_status,
                ..
            } => {
                assert_eq!(*delivery_status, DeliveryStatus::Sent);
                *id
            }
            other => panic!("expected direct_message, got {:?}", other),
        };

        let row = db.get_message(message_id).unwrap().unwrap();
        assert_eq!(row.delivery_status, DeliveryStatus::Sent.as_i64());
    }

    #[tokio::test]
    async fn direct_message_to_unknown_user_is_a_not_found_event() {
        let db = test_db();
        let alice = db
            .create_user("alice", "alice@example.com", "x", None, None)
            .unwrap();

        let dispatcher = Dispatcher::new();
        let (mut session, mut rx) = attach_session(&dispatcher, alice.id, "alice");

        handle_command(
            &dispatcher,
            &db,
            &mut session,
            GatewayCommand::DirectMessage {
                to: "ghost".into(),
                message: "hi".into(),
            },
        )
        .await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], GatewayEvent::Error { error, .. } if error == "not_found"));
    }

    #[tokio::test]
    async fn disconnect_request_sends_farewell_and_closes() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (mut session, mut rx) = attach_session(&dispatcher, 1, "alice");

        let keep = handle_command(
            &dispatcher,
            &db,
            &mut session,
            GatewayCommand::DisconnectRequest {},
        )
        .await;

        assert!(!keep);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            GatewayEvent::ServerResponse { data, .. } if data == "Disconnected!"
        ));
    }
}
