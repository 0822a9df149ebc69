//! # WebSocket Audio Bridge Handler
//!
//! Clients connect to `/audio` and exchange raw PCM (48kHz, mono, s16le) as
//! binary WebSocket messages in both directions.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Opening the socket starts one audio session
//! 2. **Client → Server**: Binary messages, written to the virtual microphone
//! 3. **Server → Client**: Binary messages, captured from the virtual speaker
//! 4. **Close**: Closing the socket tears the session down
//!
//! There is no control channel. Text messages are ignored, and failures on
//! the server side show up as the socket closing.
//!
//! ## Backpressure:
//! - Inbound: messages go to the session's bounded inbound queue; when it is
//!   full the message is dropped and counted, and the actor keeps reading
//! - Outbound: frames go through the actor mailbox, bounded by
//!   `outbound_queue_frames`; when it is full the capture relay drops frames

use crate::audio::playback::{InboundMessage, InboundPolicy};
use crate::audio::session::{SessionId, SessionManager};
use crate::audio::transport::FrameSink;
use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One captured PCM chunk on its way to the client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct OutboundFrame(pub Bytes);

/// Server-initiated close of the connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseTransport;

/// WebSocket actor for one bridge connection.
///
/// ## Actor Model:
/// The actor owns the socket. The session core never touches it directly;
/// it holds a [`WsTransport`] that posts messages to this actor's mailbox.
pub struct AudioWebSocket {
    sessions: Arc<SessionManager>,
    session_id: Option<SessionId>,
    policy: InboundPolicy,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    outbound_queue_frames: usize,
}

impl AudioWebSocket {
    pub fn new(sessions: Arc<SessionManager>, config: &AppConfig) -> Self {
        Self {
            sessions,
            session_id: None,
            policy: InboundPolicy::new(config.audio.max_message_bytes),
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(config.performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.performance.client_timeout_secs),
            outbound_queue_frames: config.audio.outbound_queue_frames,
        }
    }

    /// Ping the client periodically and drop it if it stops answering.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session = ?act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Hand a message to the session. Never suspends the actor, so a stalled
    /// playback process cannot hold up close frames or outbound audio.
    fn route(&mut self, message: InboundMessage) {
        if let Err(rejection) = self.policy.check(&message) {
            let err = BridgeError::from(rejection);
            warn!(session = ?self.session_id, error = %err, "Dropping inbound message");
            return;
        }
        let Some(id) = self.session_id else {
            return;
        };

        self.sessions.on_message(id, message);
    }
}

/// Close code sent when a session cannot be started.
fn close_code_for(err: &BridgeError) -> ws::CloseCode {
    match err {
        BridgeError::SessionLimitReached(_) => ws::CloseCode::Again,
        _ => ws::CloseCode::Error,
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(self.outbound_queue_frames);
        self.start_heartbeat(ctx);

        let transport = Arc::new(WsTransport::new(ctx.address()));
        match self.sessions.on_connect(transport) {
            Ok(handle) => {
                info!(session = %handle.id(), "Client connected");
                self.session_id = Some(handle.id());
            }
            Err(err) => {
                error!(error = %err, "Failed to start audio session");
                ctx.close(Some(close_code_for(&err).into()));
                ctx.stop();
            }
        }
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let Some(id) = self.session_id.take() else {
            return;
        };
        info!(session = %id, "Client disconnected");

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            sessions.on_disconnect(id).await;
        });
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.route(InboundMessage::Binary(data));
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.route(InboundMessage::Text(text.to_string()));
            }
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session = ?self.session_id, reason = ?reason, "Client sent close");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session = ?self.session_id, "Received continuation frame, ignoring");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session = ?self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundFrame> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<CloseTransport> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseTransport, ctx: &mut Self::Context) {
        debug!(session = ?self.session_id, "Closing connection from server side");
        ctx.close(Some(ws::CloseCode::Away.into()));
        ctx.stop();
    }
}

/// [`FrameSink`] over the mailbox of an [`AudioWebSocket`] actor.
pub struct WsTransport {
    addr: Addr<AudioWebSocket>,
}

impl WsTransport {
    pub fn new(addr: Addr<AudioWebSocket>) -> Self {
        Self { addr }
    }
}

impl FrameSink for WsTransport {
    fn is_ready(&self) -> bool {
        self.addr.connected()
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), BridgeError> {
        self.addr
            .try_send(OutboundFrame(frame))
            .map_err(|err| match err {
                SendError::Full(_) => BridgeError::TransportNotReady("outbound queue full"),
                SendError::Closed(_) => BridgeError::TransportNotReady("connection closed"),
            })
    }

    fn close(&self) {
        self.addr.do_send(CloseTransport);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and starts an [`AudioWebSocket`] actor. The frame size
/// limit is raised above the inbound message ceiling so oversized messages
/// reach the validation policy instead of failing the protocol.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req
        .connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_string();
    info!(peer = %peer, "New WebSocket connection request");

    let config = app_state.config();
    let actor = AudioWebSocket::new(app_state.sessions(), config);

    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(config.audio.max_frame_bytes)
        .start()
}
