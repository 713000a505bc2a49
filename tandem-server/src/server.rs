//! WebSocket front end over a [`Curator`].
//!
//! ```text
//! Client A ──┐                        ┌── Binder (doc 1)
//!            ├── Server ── Curator ───┤
//! Client B ──┘                        └── Binder (doc 2)
//! ```
//!
//! Each connection opens exactly one document session. The connection task
//! then relays requests into the [`Portal`] and forwards traffic from other
//! sessions back to the socket until either side goes away.
//!
//! When `admin_token` is configured, any connection may also run the
//! `get_users` and `kick_user` operator commands, with or without an open
//! document.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_collab::{
    BinderError, Curator, CuratorError, Document, Message, Portal, PortalEvent, StoreError,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::protocol::{ClientRequest, ServerResponse};

type ConnectionError = Box<dyn std::error::Error + Send + Sync>;

/// State shared by every connection task.
struct Context {
    curator: Arc<Curator>,
    timeout: Duration,
    admin_token: String,
}

/// The collaboration server.
pub struct Server {
    config: ServerConfig,
    curator: Arc<Curator>,
}

impl Server {
    /// Build the store and authenticator described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = config.store.build()?;
        let auth = config.auth.build();
        let curator = Curator::new(config.curator.clone(), auth, store);
        Ok(Self::with_curator(config, Arc::new(curator)))
    }

    /// Serve an existing curator. The curator and store sections of `config`
    /// are ignored.
    pub fn with_curator(config: ServerConfig, curator: Arc<Curator>) -> Self {
        Self { config, curator }
    }

    pub fn curator(&self) -> &Arc<Curator> {
        &self.curator
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept WebSocket connections on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Tandem server listening on {}", listener.local_addr()?);
        if self.config.admin_token.is_empty() {
            log::info!("Admin commands disabled");
        }

        let context = Arc::new(Context {
            curator: self.curator.clone(),
            timeout: self.config.request_timeout(),
            admin_token: self.config.admin_token.clone(),
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let context = context.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, context).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<Context>,
) -> Result<(), ConnectionError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    let mut portal = loop {
        let request = match next_request(&mut ws_receiver).await? {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                send(&mut ws_sender, &ServerResponse::error(e)).await?;
                return Ok(());
            }
            None => {
                log::debug!("Connection from {addr} closed before opening a document");
                return Ok(());
            }
        };

        let request = match request {
            ClientRequest::Ping => {
                send(&mut ws_sender, &ServerResponse::Pong).await?;
                continue;
            }
            ClientRequest::GetUsers { admin_token } => {
                send(&mut ws_sender, &get_users(&context, &admin_token).await).await?;
                continue;
            }
            ClientRequest::KickUser {
                admin_token,
                document_id,
                user_id,
            } => {
                let response = kick_user(&context, &admin_token, document_id, user_id).await;
                send(&mut ws_sender, &response).await?;
                continue;
            }
            request => request,
        };

        match open_portal(&context, request).await {
            Some(Ok(portal)) => break portal,
            None => {
                send(&mut ws_sender, &ServerResponse::error("no document is open")).await?;
            }
            Some(Err(e)) => {
                log::warn!("Rejected session from {addr}: {e}");
                send(&mut ws_sender, &ServerResponse::error(e)).await?;
                return Ok(());
            }
        }
    };

    let Some(document) = portal.release_document() else {
        return Err("portal carries no document".into());
    };
    log::info!(
        "{addr} joined document {} as {} (session {})",
        document.id,
        portal.client().user_id,
        portal.client().session_id
    );

    let result = async {
        let version = portal.base_version();
        send(&mut ws_sender, &ServerResponse::Document { document, version }).await?;
        relay(&context, &mut portal, &mut ws_sender, &mut ws_receiver).await
    }
    .await;

    // Tell the others this session is gone, then leave.
    let goodbye = Message {
        active: false,
        ..Default::default()
    };
    if let Err(e) = portal.send_message(goodbye).await {
        log::debug!("Could not announce departure of {addr}: {e}");
    }
    portal.exit(context.timeout).await;
    log::info!("{addr} disconnected");

    result
}

/// Session phase: relay between the socket and the portal.
async fn relay<S, R>(
    context: &Context,
    portal: &mut Portal,
    ws_sender: &mut S,
    ws_receiver: &mut R,
) -> Result<(), ConnectionError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
    R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        tokio::select! {
            request = next_request(ws_receiver) => {
                let request = match request? {
                    Some(Ok(request)) => request,
                    Some(Err(e)) => {
                        send(ws_sender, &ServerResponse::error(e)).await?;
                        continue;
                    }
                    None => return Ok(()),
                };

                match request {
                    ClientRequest::Submit { transform } => {
                        match portal.send_transform(transform, context.timeout).await {
                            Ok(version) => {
                                send(ws_sender, &ServerResponse::Correction { version }).await?;
                            }
                            Err(BinderError::Closed) => {
                                send(ws_sender, &ServerResponse::error(BinderError::Closed)).await?;
                                return Ok(());
                            }
                            Err(e) => send(ws_sender, &ServerResponse::error(e)).await?,
                        }
                    }
                    ClientRequest::Update { message, position } => {
                        let message = Message {
                            message,
                            position,
                            active: true,
                        };
                        if portal.send_message(message).await.is_err() {
                            send(ws_sender, &ServerResponse::error(BinderError::Closed)).await?;
                            return Ok(());
                        }
                    }
                    ClientRequest::Ping => send(ws_sender, &ServerResponse::Pong).await?,
                    ClientRequest::GetUsers { admin_token } => {
                        send(ws_sender, &get_users(context, &admin_token).await).await?;
                    }
                    ClientRequest::KickUser {
                        admin_token,
                        document_id,
                        user_id,
                    } => {
                        let response = kick_user(context, &admin_token, document_id, user_id).await;
                        send(ws_sender, &response).await?;
                    }
                    ClientRequest::Create { .. }
                    | ClientRequest::Edit { .. }
                    | ClientRequest::Read { .. } => {
                        send(ws_sender, &ServerResponse::error("a document is already open")).await?;
                    }
                }
            }
            event = portal.recv() => {
                match event {
                    Some(PortalEvent::Transform(ot)) => {
                        send(ws_sender, &ServerResponse::Transforms { transforms: vec![ot] }).await?;
                    }
                    Some(PortalEvent::Update(update)) => {
                        send(ws_sender, &ServerResponse::Update { user_updates: vec![update] }).await?;
                    }
                    None => {
                        log::debug!("Session {} ended by its binder", portal.client().session_id);
                        send(ws_sender, &ServerResponse::error(BinderError::Closed)).await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Open the session `request` asks for. `None` if it does not open one.
async fn open_portal(
    context: &Context,
    request: ClientRequest,
) -> Option<Result<Portal, CuratorError>> {
    let curator = &context.curator;
    let timeout = context.timeout;
    let opened = match request {
        ClientRequest::Create {
            token,
            user_id,
            document,
        } => {
            let user_id = user_or_anonymous(user_id);
            let document = Document::new(document.content);
            curator.create_document(&user_id, &token, document, timeout).await
        }
        ClientRequest::Edit {
            token,
            user_id,
            document_id,
        } => {
            let user_id = user_or_anonymous(user_id);
            curator.edit_document(&user_id, &token, &document_id, timeout).await
        }
        ClientRequest::Read {
            token,
            user_id,
            document_id,
        } => {
            let user_id = user_or_anonymous(user_id);
            curator.read_document(&user_id, &token, &document_id, timeout).await
        }
        ClientRequest::Submit { .. }
        | ClientRequest::Update { .. }
        | ClientRequest::Ping
        | ClientRequest::GetUsers { .. }
        | ClientRequest::KickUser { .. } => return None,
    };
    Some(opened)
}

fn is_admin(context: &Context, admin_token: &str) -> bool {
    let allowed = !context.admin_token.is_empty() && admin_token == context.admin_token;
    if !allowed {
        log::info!("Rejected admin command with an invalid token");
    }
    allowed
}

async fn get_users(context: &Context, admin_token: &str) -> ServerResponse {
    if !is_admin(context, admin_token) {
        return ServerResponse::error(CuratorError::Unauthorized);
    }
    match context.curator.get_users(context.timeout).await {
        Ok(users) => ServerResponse::Users { users },
        Err(e) => {
            log::error!("get_users failed: {e}");
            ServerResponse::error(e)
        }
    }
}

async fn kick_user(
    context: &Context,
    admin_token: &str,
    document_id: String,
    user_id: String,
) -> ServerResponse {
    if !is_admin(context, admin_token) {
        return ServerResponse::error(CuratorError::Unauthorized);
    }
    match context
        .curator
        .kick_user(&document_id, &user_id, context.timeout)
        .await
    {
        Ok(()) => ServerResponse::Kicked {
            document_id,
            user_id,
        },
        Err(e) => {
            log::warn!("kick_user {user_id} from {document_id} failed: {e}");
            ServerResponse::error(e)
        }
    }
}

fn user_or_anonymous(user_id: String) -> String {
    if user_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        user_id
    }
}

/// Next request from the socket. `None` once the peer closed the connection;
/// `Some(Err)` for frames that are not a valid request.
async fn next_request<R>(
    ws_receiver: &mut R,
) -> Result<Option<Result<ClientRequest, String>>, ConnectionError>
where
    R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        match ws_receiver.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return Ok(Some(
                    serde_json::from_str(text.as_str()).map_err(|e| format!("invalid request: {e}")),
                ));
            }
            Some(Ok(WsMessage::Binary(_))) => {
                return Ok(Some(Err("binary frames are not supported".to_string())));
            }
            Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
            // Ping and pong frames are answered by tungstenite.
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed)) => return Ok(None),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn send<S>(ws_sender: &mut S, response: &ServerResponse) -> Result<(), ConnectionError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let text = serde_json::to_string(response)?;
    ws_sender.send(WsMessage::Text(text.into())).await?;
    Ok(())
}
