//! WebSocket Handler
//!
//! Every connected socket is one hub client. Envelopes go out as text
//! frames; anything the client sends is ignored apart from a close.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use live_relay::HubHandle;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metrics::ServerMetrics;

pub async fn handle_socket(socket: WebSocket, hub: HubHandle, metrics: Arc<ServerMetrics>) {
    let mut subscription = match hub.register().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "Rejecting websocket connection");
            return;
        }
    };
    let client = subscription.id();
    metrics.connection_opened();
    info!(client, "WebSocket client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = async {
        while let Some(frame) = subscription.recv().await {
            if ws_sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                return;
            }
        }
        // Evicted or the hub shut down.
        let _ = ws_sender.close().await;
    };

    let recv_task = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = send_task => debug!(client, "Outbound queue closed"),
        _ = recv_task => debug!(client, "Client closed the connection"),
    }

    hub.unregister(client);
    metrics.connection_closed();
    info!(client, "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use crate::AppState;
    use crate::test_helpers::{post_json, test_app_state};
    use futures::{SinkExt, StreamExt};
    use live_relay::Envelope;
    use live_relay::cluster::WatchEvent;
    use live_relay::testing::FakeCluster;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn serve(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::router(state)).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
            .await
            .unwrap();
        socket
    }

    async fn wait_for_clients(state: &AppState, n: u64) {
        timeout(Duration::from_secs(2), async {
            while state.hub.stats().await.unwrap().clients != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn next_text(socket: &mut Client) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(2), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_socket_receives_published_envelopes() {
        let (state, _shutdown) = test_app_state(FakeCluster::new(["prod"]));
        let addr = serve(state.clone()).await;
        let mut first = connect(addr).await;
        let mut second = connect(addr).await;
        wait_for_clients(&state, 2).await;

        let envelope = Envelope::from_value("Pod-prod-updated", json!({"metadata": {"name": "api-0"}}));
        state.hub.publish(&envelope).unwrap();

        let expected = json!({"event": "Pod-prod-updated", "payload": {"metadata": {"name": "api-0"}}});
        assert_eq!(next_text(&mut first).await, expected);
        assert_eq!(next_text(&mut second).await, expected);
        assert_eq!(state.metrics.snapshot(None, 0).connections.total, 2);
    }

    #[tokio::test]
    async fn test_client_input_is_ignored() {
        let (state, _shutdown) = test_app_state(FakeCluster::new(["prod"]));
        let addr = serve(state.clone()).await;
        let mut socket = connect(addr).await;
        wait_for_clients(&state, 1).await;

        socket.send(Message::Text("hello".into())).await.unwrap();
        state
            .hub
            .publish(&Envelope::from_value("ping", json!(1)))
            .unwrap();
        assert_eq!(next_text(&mut socket).await["event"], "ping");
    }

    #[tokio::test]
    async fn test_close_unregisters_client() {
        let (state, _shutdown) = test_app_state(FakeCluster::new(["prod"]));
        let addr = serve(state.clone()).await;
        let mut socket = connect(addr).await;
        wait_for_clients(&state, 1).await;

        socket.close(None).await.unwrap();
        wait_for_clients(&state, 0).await;
        timeout(Duration::from_secs(2), async {
            while state.metrics.snapshot(None, 0).connections.active != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_hub_shutdown_closes_socket() {
        let (state, shutdown) = test_app_state(FakeCluster::new(["prod"]));
        let addr = serve(state.clone()).await;
        let mut socket = connect(addr).await;
        wait_for_clients(&state, 1).await;

        shutdown.cancel();
        let end = timeout(Duration::from_secs(2), async {
            loop {
                match socket.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(end.is_ok());
    }

    #[tokio::test]
    async fn test_watch_request_streams_to_socket() {
        let fake = FakeCluster::new(["prod"]);
        let (state, _shutdown) = test_app_state(fake.clone());
        let addr = serve(state.clone()).await;
        let mut socket = connect(addr).await;
        wait_for_clients(&state, 1).await;

        let (status, _) = post_json(
            crate::router(state.clone()),
            "/api/watch_dynamic_resource",
            json!({"server": "prod", "apiResource": {"group": "apps", "version": "v1", "kind": "Deployment"}}),
        )
        .await;
        assert_eq!(status, axum::http::StatusCode::OK);

        let sender = fake.watch_sender(0).await.unwrap();
        sender
            .send(Ok(WatchEvent::Modified(json!({"metadata": {"name": "web"}}))))
            .unwrap();
        sender
            .send(Ok(WatchEvent::Deleted(json!({"metadata": {"name": "old"}}))))
            .unwrap();

        let updated = next_text(&mut socket).await;
        assert_eq!(updated["event"], "Deployment-prod-updated");
        assert_eq!(updated["payload"]["metadata"]["name"], "web");
        assert_eq!(updated["payload"]["kind"], "Deployment");
        assert_eq!(updated["payload"]["apiVersion"], "apps/v1");

        let deleted = next_text(&mut socket).await;
        assert_eq!(deleted["event"], "Deployment-prod-deleted");
        assert_eq!(deleted["payload"]["metadata"]["name"], "old");
    }
}
