// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The WebSocket server.
//!
//! One warp server carries everything: upgrade requests under the
//! `/elm-watch` path become client connections, upgrades under any other
//! path are accepted just long enough to explain the mistake, and plain
//! HTTP requests get a tiny landing page. Raw connection, message, and
//! close events are forwarded to the controller; all protocol decisions
//! happen there.

use futures::{FutureExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use warp::{
    ws::{Message as WsMessage, WebSocket},
    Filter, Reply,
};

use crate::protocol::{
    ClientErrorReason, ServerFrame, WebSocketParams, PROTOCOL_VERSION, WEBSOCKET_PATH,
};

/// Where the port number came from; decides how a bind conflict reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortPreference {
    NoPort,
    PersistedPort(u16),
    PortFromConfig(u16),
}

impl PortPreference {
    fn port(self) -> u16 {
        match self {
            PortPreference::NoPort => 0,
            PortPreference::PersistedPort(port) => port,
            PortPreference::PortFromConfig(port) => port,
        }
    }
}

#[derive(Debug)]
pub enum PortError {
    Conflict { preference: PortPreference },
    Other { message: String },
}

/// Raw events out of the server, in arrival order per connection.
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        id: u64,
        /// Pre-validated URL parameters: prefix, decode, token, and
        /// version checks happen here; target resolution is left to the
        /// controller.
        params: Result<WebSocketParams, ClientErrorReason>,
    },
    MessageReceived {
        id: u64,
        data: String,
    },
    Closed {
        id: u64,
    },
}

#[derive(Debug)]
struct ClientHandle {
    sender: mpsc::UnboundedSender<Result<WsMessage, warp::Error>>,
}

type Clients = Arc<Mutex<HashMap<u64, ClientHandle>>>;

#[derive(Debug)]
struct ServerShared {
    clients: Clients,
    events: mpsc::UnboundedSender<ServerEvent>,
    token: String,
    next_id: AtomicU64,
}

/// A running WebSocket server. May outlive one controller run: restarts
/// that keep `elm-watch.json` unchanged reuse it.
#[derive(Debug)]
pub struct WebSocketServer {
    pub port: u16,
    pub token: String,
    shared: Arc<ServerShared>,
    shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl WebSocketServer {
    /// Bind and start serving. A conflict on a requested port is fatal to
    /// the caller; only `NoPort` falls through to an OS-assigned port.
    pub async fn start(
        preference: PortPreference,
        token: String,
        landing_html: String,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<WebSocketServer, PortError> {
        let shared = Arc::new(ServerShared {
            clients: Arc::new(Mutex::new(HashMap::new())),
            events,
            token,
            next_id: AtomicU64::new(1),
        });

        let with_shared = {
            let shared = shared.clone();
            warp::any().map(move || shared.clone())
        };

        // Upgrades under the expected path. The query string is captured
        // raw so that an undecodable one still produces a connection that
        // can be told what went wrong.
        let ws_route = warp::path(WEBSOCKET_PATH)
            .and(warp::path::end())
            .and(warp::query::raw().or(warp::any().map(String::new)).unify())
            .and(warp::ws())
            .and(with_shared.clone())
            .map(
                |query: String, ws: warp::ws::Ws, shared: Arc<ServerShared>| {
                    ws.on_upgrade(move |socket| {
                        let params = validate_query(&shared, &query);
                        client_connection(socket, shared, params)
                    })
                    .into_response()
                },
            );

        // Upgrades anywhere else: accept, then explain.
        let wrong_path_route = warp::path::full()
            .and(warp::ws())
            .and(with_shared.clone())
            .map(
                |path: warp::path::FullPath, ws: warp::ws::Ws, shared: Arc<ServerShared>| {
                    let actual_path = path.as_str().to_owned();
                    ws.on_upgrade(move |socket| {
                        client_connection(
                            socket,
                            shared,
                            Err(ClientErrorReason::WrongUrlPrefix { actual_path }),
                        )
                    })
                    .into_response()
                },
            );

        // Everything else gets the landing page.
        let landing_route = warp::any().map(move || {
            warp::reply::with_header(
                landing_html.clone(),
                "Content-Type",
                "text/html; charset=utf-8",
            )
            .into_response()
        });

        let routes = ws_route.or(wrong_path_route).or(landing_route);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let addr: SocketAddr = ([127, 0, 0, 1], preference.port()).into();

        let (bound_addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, async {
                shutdown_rx.await.ok();
            })
            .map_err(|e| match preference {
                PortPreference::NoPort => PortError::Other {
                    message: e.to_string(),
                },
                _ => PortError::Conflict { preference },
            })?;

        tokio::task::spawn(server);

        Ok(WebSocketServer {
            port: bound_addr.port(),
            token: shared.token.clone(),
            shared,
            shutdown: std::sync::Mutex::new(Some(shutdown_tx)),
        })
    }

    pub async fn send(&self, id: u64, frame: &ServerFrame) {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(_) => return,
        };
        if let Some(client) = self.shared.clients.lock().await.get(&id) {
            let _ = client.sender.send(Ok(WsMessage::text(text)));
        }
    }

    pub async fn num_clients(&self) -> usize {
        self.shared.clients.lock().await.len()
    }

    /// Stop accepting and drop all connections. Idempotent.
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// Prefix and decode are route-level; token and version are checked here.
/// Target resolution needs the project and stays with the controller.
fn validate_query(
    shared: &ServerShared,
    query: &str,
) -> Result<WebSocketParams, ClientErrorReason> {
    let params = WebSocketParams::parse_query(query)
        .map_err(|message| ClientErrorReason::BadQuery { message })?;

    if !constant_time_eq::constant_time_eq(
        params.web_socket_token.as_bytes(),
        shared.token.as_bytes(),
    ) {
        return Err(ClientErrorReason::WrongToken);
    }

    if params.elm_watch_version != PROTOCOL_VERSION {
        return Err(ClientErrorReason::WrongVersion {
            client_version: params.elm_watch_version.clone(),
        });
    }

    Ok(params)
}

async fn client_connection(
    ws: WebSocket,
    shared: Arc<ServerShared>,
    params: Result<WebSocketParams, ClientErrorReason>,
) {
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let (client_ws_tx, mut client_ws_rx) = ws.split();
    let (client_outbound_tx, client_outbound_rx) = mpsc::unbounded_channel();

    shared.clients.lock().await.insert(
        id,
        ClientHandle {
            sender: client_outbound_tx,
        },
    );

    // A task that forwards queued frames out to the socket.
    let client_outbound_stream = UnboundedReceiverStream::new(client_outbound_rx);
    tokio::task::spawn(client_outbound_stream.forward(client_ws_tx).map(|result| {
        if let Err(e) = result {
            eprintln!("error sending websocket message: {e}");
        }
    }));

    let _ = shared.events.send(ServerEvent::Connected { id, params });

    while let Some(result) = client_ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(_) => break,
        };
        if msg.is_close() {
            break;
        }
        if let Ok(text) = msg.to_str() {
            let _ = shared.events.send(ServerEvent::MessageReceived {
                id,
                data: text.to_owned(),
            });
        }
    }

    shared.clients.lock().await.remove(&id);
    let _ = shared.events.send(ServerEvent::Closed { id });
}

/// The page shown to a plain browser request: which targets exist and how
/// pages connect.
pub fn landing_page(target_names: &[String]) -> String {
    let mut items = String::new();
    for name in target_names {
        items.push_str(&format!("<li><code>{name}</code></li>\n"));
    }
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><meta charset=\"utf-8\"><title>elm-watch</title></head>\n\
         <body>\n\
         <h1>elm-watch</h1>\n\
         <p>This is the elm-watch WebSocket server. Compiled pages connect\n\
         here automatically; there is nothing to browse.</p>\n\
         <ul>\n{items}</ul>\n\
         </body>\n\
         </html>\n"
    )
}
