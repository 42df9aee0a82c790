use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::core::{
    ClientCommand, ConnectionId, DisconnectReason, Envelope, ServerMessage, SharedHub, Transport,
};
use crate::error::{HubError, Result};

/// Transport that writes notifications to open WebSocket sessions
#[derive(Default)]
pub struct WsTransport {
    sinks: DashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, id: ConnectionId, sender: mpsc::UnboundedSender<Message>) {
        self.sinks.insert(id, sender);
    }

    fn detach(&self, id: &ConnectionId) -> Option<mpsc::UnboundedSender<Message>> {
        self.sinks.remove(id).map(|(_, sender)| sender)
    }

    fn sink(&self, id: &ConnectionId) -> Option<mpsc::UnboundedSender<Message>> {
        self.sinks.get(id).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn deliver(&self, connection_id: &ConnectionId, envelope: &Envelope) -> Result<()> {
        let sink = self.sink(connection_id).ok_or_else(|| HubError::DeliveryFailure {
            connection_id: connection_id.clone(),
            reason: "no open socket".to_string(),
        })?;
        let frame = serde_json::to_string(&ServerMessage::from(envelope))?;
        sink.send(Message::text(frame))
            .map_err(|_| HubError::ConnectionClosed)
    }

    async fn close(&self, connection_id: &ConnectionId) {
        // Evicted clients get a close frame; a client that already left ignores it.
        if let Some(sink) = self.detach(connection_id) {
            let _ = sink.send(Message::close());
        }
    }
}

// Handle a WebSocket connection
pub async fn handle_ws_client(
    ws: WebSocket,
    user_id: Option<String>,
    hub: SharedHub,
    transport: Arc<WsTransport>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Spawn a task to forward messages from our channel to the WebSocket
    tokio::task::spawn(async move {
        let mut rx = rx;
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = ws_tx.send(message).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let client_id = ConnectionId::generate();
    transport.attach(client_id.clone(), tx.clone());

    // The welcome frame goes out before the connect announcement
    send_frame(
        &tx,
        &ServerMessage::Connected {
            connection_id: client_id.to_string(),
        },
    );

    if let Err(e) = hub.connect(client_id.clone(), user_id.as_deref()).await {
        error!("Failed to register client {}: {}", client_id, e);
        send_error(&tx, &e);
        transport.detach(&client_id);
        return;
    }

    let mut reason = DisconnectReason::ClientClosed;

    // Handle incoming messages
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if msg.is_close() {
                    break;
                }
                // Only process text messages
                if msg.is_text() {
                    process_message(msg, &client_id, &hub, &tx).await;
                }
            }
            Err(e) => {
                warn!("WebSocket error on {}: {}", client_id, e);
                reason = DisconnectReason::TransportError;
                break;
            }
        }
    }

    // Client disconnected; a no-op if the hub already evicted it
    if !hub.disconnect(&client_id, reason).await {
        debug!("Client {} was already removed", client_id);
    }
    transport.detach(&client_id);
}

// Process an incoming WebSocket message
async fn process_message(
    msg: Message,
    client_id: &ConnectionId,
    hub: &SharedHub,
    tx: &mpsc::UnboundedSender<Message>,
) {
    // Extract the message content
    let msg_str = match msg.to_str() {
        Ok(s) => s,
        Err(_) => {
            warn!("Failed to extract text from message of {}", client_id);
            return;
        }
    };

    let command = match serde_json::from_str::<ClientCommand>(msg_str) {
        Ok(command) => command,
        Err(e) => {
            warn!("Failed to parse command from {}: {}", client_id, e);
            send_error(tx, &HubError::from(e));
            return;
        }
    };

    let name = command.name();
    match hub.handle_command(client_id, command).await {
        Ok(reply) => {
            info!("Handled {} from {}", name, client_id);
            send_frame(tx, &reply);
        }
        Err(e) => {
            warn!("Command {} from {} rejected: {}", name, client_id, e);
            send_error(tx, &e);
        }
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, err: &HubError) {
    send_frame(
        tx,
        &ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        },
    );
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            if tx.send(Message::text(text)).is_err() {
                debug!("Socket closed before reply could be sent");
            }
        }
        Err(e) => error!("Failed to serialize server message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Target;

    #[tokio::test]
    async fn test_deliver_writes_notification_frame() {
        let transport = WsTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from("c1");
        transport.attach(id.clone(), tx);

        let envelope = Envelope::new(Target::All, "hello");
        transport.deliver(&id, &envelope).await.unwrap();

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_str().unwrap()).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["message"], "hello");
    }

    #[tokio::test]
    async fn test_deliver_to_missing_socket_fails() {
        let transport = WsTransport::new();
        let envelope = Envelope::new(Target::All, "hello");
        let result = transport.deliver(&ConnectionId::from("nobody"), &envelope).await;
        assert!(matches!(result, Err(HubError::DeliveryFailure { .. })));
    }

    #[tokio::test]
    async fn test_deliver_to_closed_socket_fails() {
        let transport = WsTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from("c1");
        transport.attach(id.clone(), tx);
        drop(rx);

        let result = transport.deliver(&id, &Envelope::new(Target::All, "x")).await;
        assert_eq!(result, Err(HubError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_sends_close_frame_and_detaches() {
        let transport = WsTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from("c1");
        transport.attach(id.clone(), tx);

        transport.close(&id).await;
        assert!(rx.recv().await.unwrap().is_close());
        assert_eq!(transport.session_count(), 0);
    }
}
