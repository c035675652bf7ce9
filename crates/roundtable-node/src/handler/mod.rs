pub mod chat;
pub mod dispatch;
pub mod presence;
pub mod session;

use crate::adapters::EndpointHost;
use dispatch::{AdapterOutcome, Binding, Dispatcher};
use roundtable::protocol::{Event, LogLevel, Request, Response, SessionInfo};
use roundtable_mesh::chat_log::ChatLog;
use roundtable_mesh::rendezvous::SignalEvent;
use roundtable_mesh::roster::Roster;
use roundtable_mesh::store::{KEY_USERNAME, KeyValueStore};
use roundtable_mesh::transport::{LinkEvent, PeerLink};
use session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Sender name used for prompts when no username is set.
pub const DEFAULT_SENDER: &str = "You";
/// Display name announced in presence when no username is set.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

// Control API error codes.
pub const CODE_CONFIRMATION_REQUIRED: &str = "confirmation_required";
pub const CODE_NOT_FOUND: &str = "not_found";
pub const CODE_TRANSPORT: &str = "transport_error";
pub const CODE_RENDEZVOUS: &str = "rendezvous_error";
pub const CODE_INVALID_REQUEST: &str = "invalid_request";
pub const CODE_NO_AGENTS: &str = "no_agents";
pub const CODE_UNAVAILABLE: &str = "unavailable";

/// Static node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's peer id, announced in link handshakes and presence.
    pub peer_id: String,
    /// Rendezvous service address.
    pub rendezvous: String,
    /// Address the host listener binds to.
    pub listen: String,
    /// Host name guests should dial, when the bound address is not reachable
    /// as is (e.g. a wildcard bind).
    pub advertise_host: Option<String>,
    /// Delay between a guest's link opening and its first presence
    /// announcement.
    pub settle: Duration,
    pub reconnect_interval: Duration,
    pub ping_interval: Duration,
}

impl NodeConfig {
    pub fn new(peer_id: String, rendezvous: String) -> Self {
        Self {
            peer_id,
            rendezvous,
            listen: "0.0.0.0:0".to_string(),
            advertise_host: None,
            settle: Duration::from_millis(1000),
            reconnect_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
        }
    }
}

/// Everything the control task reacts to.
pub enum ControlEvent {
    Request {
        req: Request,
        reply: oneshot::Sender<Response>,
    },
    Link {
        epoch: u64,
        event: LinkEvent,
    },
    Signal {
        epoch: u64,
        event: SignalEvent,
    },
    /// A guest's rendezvous lookup and dial finished.
    GuestDialed {
        epoch: u64,
        result: Result<PeerLink, session::DialFailure>,
    },
    SettleElapsed {
        epoch: u64,
    },
    Adapter(AdapterOutcome),
    Scanned {
        bindings: Vec<Binding>,
        reply: Option<oneshot::Sender<Response>>,
    },
}

/// Node state. Owned exclusively by the control task; every mutation happens
/// there in response to a [`ControlEvent`].
pub struct NodeState {
    pub config: NodeConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub log: ChatLog,
    pub roster: Roster,
    pub session: Session,
    pub dispatcher: Dispatcher,
    pub endpoints: Option<Arc<dyn EndpointHost>>,
    /// Raw username as set by the user; may be empty.
    pub username: String,
    pub event_tx: broadcast::Sender<Event>,
    control_tx: mpsc::Sender<ControlEvent>,
    control_rx: Option<mpsc::Receiver<ControlEvent>>,
    shutdown: bool,
}

impl NodeState {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn KeyValueStore>,
        endpoints: Option<Arc<dyn EndpointHost>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (control_tx, control_rx) = mpsc::channel(256);
        let username = store
            .get(KEY_USERNAME)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let log = ChatLog::load(store.clone());
        if !log.is_empty() {
            tracing::info!(entries = log.len(), "restored chat history");
        }
        Self {
            config,
            store,
            log,
            roster: Roster::new(),
            session: Session::default(),
            dispatcher: Dispatcher::new(),
            endpoints,
            username,
            event_tx,
            control_tx,
            control_rx: Some(control_rx),
            shutdown: false,
        }
    }

    /// Start the control task.
    pub fn spawn(mut self) -> (NodeHandle, JoinHandle<()>) {
        let handle = NodeHandle {
            control_tx: self.control_tx.clone(),
            event_tx: self.event_tx.clone(),
            peer_id: self.config.peer_id.clone(),
        };
        let join = match self.control_rx.take() {
            Some(rx) => tokio::spawn(run(self, rx)),
            // Already spawned once; nothing left to drive.
            None => tokio::spawn(async {}),
        };
        (handle, join)
    }

    /// Sender name for locally authored prompts.
    pub fn sender_name(&self) -> String {
        match self.username.trim() {
            "" => DEFAULT_SENDER.to_string(),
            name => name.to_string(),
        }
    }

    /// Display name announced in presence.
    pub fn display_name(&self) -> String {
        match self.username.trim() {
            "" => DEFAULT_DISPLAY_NAME.to_string(),
            name => name.to_string(),
        }
    }

    pub fn control_tx(&self) -> mpsc::Sender<ControlEvent> {
        self.control_tx.clone()
    }

    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            role: self.session.role,
            status: self.session.status,
            room_id: self.session.room_id.clone(),
            peer_id: self.config.peer_id.clone(),
            username: self.display_name(),
            sender: self.sender_name(),
            links: self.session.open_link_count(),
            signaling: self.session.signaling,
        }
    }

    /// Emit a user-facing status line as both a tracing event and a control
    /// event.
    pub fn system_log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!(target: "roundtable_node::system", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "roundtable_node::system", "{message}"),
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(target: "roundtable_node::system", "{message}")
            }
        }
        let _ = self.event_tx.send(Event::SystemLog { level, message });
    }

    pub fn emit_status(&self) {
        let _ = self.event_tx.send(Event::StatusChanged {
            status: self.session_info(),
        });
    }

    pub fn emit_roster(&self) {
        let _ = self.event_tx.send(Event::RosterChanged {
            roster: self.roster.entries(),
        });
    }
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    control_tx: mpsc::Sender<ControlEvent>,
    event_tx: broadcast::Sender<Event>,
    peer_id: String,
}

impl NodeHandle {
    /// Submit a control request and wait for its response.
    pub async fn request(&self, req: Request) -> Response {
        let (reply, rx) = oneshot::channel();
        if self
            .control_tx
            .send(ControlEvent::Request { req, reply })
            .await
            .is_err()
        {
            return error_response(CODE_UNAVAILABLE, "node is shutting down");
        }
        rx.await
            .unwrap_or_else(|_| error_response(CODE_UNAVAILABLE, "request dropped"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Resolves once the control task has stopped.
    pub async fn closed(&self) {
        self.control_tx.closed().await
    }
}

async fn run(mut state: NodeState, mut rx: mpsc::Receiver<ControlEvent>) {
    let mut log_rx = state.log.subscribe();
    tracing::info!(peer_id = %state.config.peer_id, "node control task started");

    while let Some(event) = rx.recv().await {
        let current = state.session.epoch;
        match event {
            ControlEvent::Request { req, reply } => handle_request(&mut state, req, reply).await,
            ControlEvent::Link { epoch, event } if epoch == current => {
                session::on_link_event(&mut state, event)
            }
            ControlEvent::Signal { epoch, event } if epoch == current => {
                session::on_signal_event(&mut state, event)
            }
            ControlEvent::GuestDialed { epoch, result } if epoch == current => {
                session::on_guest_dialed(&mut state, result)
            }
            ControlEvent::SettleElapsed { epoch } if epoch == current => {
                presence::announce(&mut state)
            }
            ControlEvent::Adapter(outcome) => dispatch::on_outcome(&mut state, outcome),
            ControlEvent::Scanned { bindings, reply } => {
                dispatch::on_scanned(&mut state, bindings, reply)
            }
            _ => tracing::debug!("dropping event from a previous session"),
        }
        forward_log_changes(&state, &mut log_rx);
        if state.shutdown {
            break;
        }
    }

    state.session.teardown();
    tracing::info!("node control task stopped");
}

fn forward_log_changes(
    state: &NodeState,
    log_rx: &mut broadcast::Receiver<roundtable::model::LogChange>,
) {
    loop {
        match log_rx.try_recv() {
            Ok(change) => {
                let _ = state.event_tx.send(Event::Log { change });
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "log change subscriber lagged");
            }
            Err(_) => break,
        }
    }
}

/// Handle a single control request.
///
/// Requests that wait on the network (`start_host`, `join_room`,
/// `scan_agents`) park `reply` and answer it from a later event.
pub async fn handle_request(state: &mut NodeState, req: Request, reply: oneshot::Sender<Response>) {
    let resp = match req {
        Request::Status => ok_json(&state.session_info()),

        // Session
        Request::StartHost { room_id } => return session::start_host(state, room_id, reply).await,
        Request::JoinRoom { room_id } => return session::start_guest(state, room_id, reply),
        Request::LeaveSession => session::leave(state),

        // Chat log
        Request::SendPrompt { text } => chat::handle_send_prompt(state, &text),
        Request::RollCall => chat::handle_roll_call(state),
        Request::Harvest => dispatch::handle_harvest(state),
        Request::History => ok_json(&state.log.entries()),
        Request::Roster => ok_json(&state.roster.entries()),
        Request::EditMessage { index, text } => chat::handle_edit(state, index, &text),
        Request::DeleteMessage { index, confirm } => chat::handle_delete(state, index, confirm),
        Request::ClearSession { confirm } => chat::handle_clear(state, confirm),
        Request::SetUsername { username } => chat::handle_set_username(state, &username),

        // Agents
        Request::ScanAgents => return dispatch::handle_scan(state, Some(reply)),
        Request::ListAgents => ok_json(&state.dispatcher.agents()),
        Request::SetAgentEnabled { agent, enabled } => {
            dispatch::handle_set_enabled(state, &agent, enabled)
        }
        Request::SetContextOptions {
            include_history,
            smart_context,
        } => dispatch::handle_context_options(state, include_history, smart_context),

        Request::Shutdown => {
            tracing::info!("shutdown requested");
            state.shutdown = true;
            ok_response(None)
        }
    };
    let _ = reply.send(resp);
}

// ---- Shared helpers ----

pub fn ok_response(data: Option<serde_json::Value>) -> Response {
    Response::Ok { data }
}

pub fn ok_json<T: serde::Serialize + ?Sized>(data: &T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => ok_response(Some(value)),
        Err(e) => error_response(CODE_INVALID_REQUEST, &format!("failed to encode reply: {e}")),
    }
}

pub fn error_response(code: &str, message: &str) -> Response {
    Response::Error {
        code: code.to_string(),
        message: message.to_string(),
    }
}
