use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Stream, StreamExt};
use metrics::counter;
use pixel_wall_core::OtpRecord;
use tracing::{debug, info, warn};

use crate::{
    registry::{ClientHandle, ClientId, ClientRegistry, ClientSink},
    state::AppState,
};

/// Entry point for a freshly upgraded socket.
pub async fn handle_socket(state: Arc<AppState>, socket: WebSocket, identity: Option<OtpRecord>) {
    let (sink, stream) = socket.split();
    let user_id = identity.map(|record| record.user_id);
    serve_connection(state, Box::pin(sink), stream, user_id).await;
}

/// Registers the client and runs its read loop until the connection ends.
///
/// The client is removed from the registry on every way out of here,
/// including a panic inside the loop.
pub async fn serve_connection<S>(
    state: Arc<AppState>,
    sink: ClientSink,
    stream: S,
    user_id: Option<String>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Send,
{
    let client = state.registry.register(sink, user_id);
    let guard = Deregister::new(state.registry.clone(), client.id());
    info!(
        client_id = %client.id(),
        user_id = client.user_id().unwrap_or("anonymous"),
        anonymous = client.is_anonymous(),
        active_clients = state.registry.len(),
        "client connected"
    );

    if let Err(err) = client.ping().await {
        warn!(client_id = %client.id(), error = %err, "initial probe failed");
        guard.release().await;
        return;
    }

    state.broadcaster.broadcast_grid().await;
    read_loop(&state, &client, stream).await;
    guard.release().await;

    info!(
        client_id = %client.id(),
        active_clients = state.registry.len(),
        "client disconnected"
    );
}

async fn read_loop<S>(state: &AppState, client: &ClientHandle, stream: S)
where
    S: Stream<Item = Result<Message, axum::Error>>,
{
    tokio::pin!(stream);
    loop {
        let next = tokio::select! {
            _ = client.closed() => {
                debug!(client_id = %client.id(), "client removed elsewhere");
                return;
            }
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(client_id = %client.id(), error = %err, "read failed");
                return;
            }
            None => return,
        };
        client.touch();

        let color = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                debug!(
                    client_id = %client.id(),
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                return;
            }
        };

        let slot = state.grid.paint(&color);
        counter!("pixel_wall_paints_total", 1);
        debug!(client_id = %client.id(), slot, "pixel painted");
        state.broadcaster.broadcast_grid().await;
    }
}

/// Removes a client when its session ends. The normal path awaits the
/// removal through [`Deregister::release`]; if the session unwinds instead,
/// the drop hook hands removal to the runtime.
struct Deregister {
    registry: ClientRegistry,
    id: ClientId,
    armed: bool,
}

impl Deregister {
    fn new(registry: ClientRegistry, id: ClientId) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        self.registry.remove(self.id).await;
    }
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = self.registry.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.remove(id).await;
                });
            }
            Err(_) => {
                registry.detach(id);
            }
        }
    }
}
