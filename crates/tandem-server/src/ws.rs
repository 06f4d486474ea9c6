//! WebSocket transport for the gateway. One task per connection.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use tandem_shared::{ChatError, ClientEvent, Participant, ServerEvent};

use crate::api::AppState;
use crate::auth::Authenticated;

pub async fn ws_handler(
    State(state): State<AppState>,
    Authenticated(participant): Authenticated,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, participant, socket))
}

async fn handle_socket(state: AppState, participant: Participant, socket: WebSocket) {
    let gateway = state.gateway.clone();
    let (session, mut rx) = gateway.connect(participant).await;
    let (mut sender, mut receiver) = socket.split();

    info!(session = %session.id, participant = %session.participant.id, "WebSocket connected");

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(event) = outgoing else { break };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Failed to encode server event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match ClientEvent::from_json(&text) {
                        Ok(event) => gateway.handle(&session, event).await,
                        Err(e) => {
                            debug!(session = %session.id, error = %e, "Malformed frame");
                            let err = ChatError::ValidationFailed(format!("malformed event: {e}"));
                            session.send(ServerEvent::error(&err, None));
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session = %session.id, error = %e, "WebSocket read failed");
                        break;
                    }
                    // Ping/pong is answered by axum; binary frames are not part of the protocol.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    gateway.disconnect(&session).await;
    info!(session = %session.id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use tandem_shared::{ConversationId, ServerEvent};

    use crate::api::{build_router, tests::test_state};

    async fn next_event<S>(stream: &mut S) -> ServerEvent
    where
        S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read failed");
            if let WsMessage::Text(text) = frame {
                return ServerEvent::from_json(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn end_to_end_over_a_real_socket() {
        let (state, f, _dir) = test_state().await;
        let c = f
            .service
            .create_or_get_conversation(f.member.id, f.counterpart.id)
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });

        let (mut member, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws?participant={}", f.member.id))
                .await
                .unwrap();
        let (mut counterpart, _) = tokio_tungstenite::connect_async(format!(
            "ws://{addr}/ws?participant={}",
            f.counterpart.id
        ))
        .await
        .unwrap();

        let join = format!(r#"{{"type":"join","conversationId":"{}"}}"#, c.id);
        counterpart.send(WsMessage::Text(join)).await.unwrap();
        assert!(matches!(
            next_event(&mut counterpart).await,
            ServerEvent::History { .. }
        ));

        let send = format!(
            r#"{{"type":"send","conversationId":"{}","content":"Hello"}}"#,
            c.id
        );
        member.send(WsMessage::Text(send)).await.unwrap();

        match next_event(&mut counterpart).await {
            ServerEvent::Message { message, .. } => assert_eq!(message.content, "Hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            next_event(&mut member).await,
            ServerEvent::Sent { delivered: true, .. }
        ));

        // Garbage gets a validation error, and the connection stays usable.
        member
            .send(WsMessage::Text("{\"type\":\"nope\"}".into()))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut member).await,
            ServerEvent::Error { .. }
        ));
        let join_unknown = format!(
            r#"{{"type":"join","conversationId":"{}"}}"#,
            ConversationId::new()
        );
        member.send(WsMessage::Text(join_unknown)).await.unwrap();
        assert!(matches!(
            next_event(&mut member).await,
            ServerEvent::Error { .. }
        ));
    }
}
