//! Session coordinator: host and guest lifecycles, link bookkeeping and the
//! host relay.

use super::{
    CODE_RENDEZVOUS, CODE_TRANSPORT, ControlEvent, NodeState, dispatch, error_response, ok_json,
    presence,
};
use roundtable::model::ChatEntry;
use roundtable::protocol::{LogLevel, Response, SessionRole, SessionStatus, SignalingState};
use roundtable::wire::{self, WireMessage};
use roundtable_mesh::chat_log::Origin;
use roundtable_mesh::rendezvous::{self, AnnounceConfig, SignalEvent};
use roundtable_mesh::transport::{self, LinkEvent, LinkId, PeerLink};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const LINK_CHANNEL_CAPACITY: usize = 256;

/// Why a guest could not reach its host.
#[derive(Debug, Clone)]
pub struct DialFailure {
    /// Control API error code.
    pub code: &'static str,
    /// Diagnostic category (`network`, `peer-unavailable`, ...).
    pub category: String,
    pub message: String,
}

struct LinkState {
    link: PeerLink,
    /// Set once the remote handshake arrives.
    remote_peer: Option<String>,
}

/// Live session instance. Replaced wholesale on every start.
#[derive(Default)]
pub struct Session {
    pub role: SessionRole,
    pub status: SessionStatus,
    pub signaling: SignalingState,
    pub room_id: Option<String>,
    /// Bumped on every reset; events tagged with an older epoch are dropped.
    pub epoch: u64,
    links: HashMap<LinkId, LinkState>,
    host_link: Option<LinkId>,
    tasks: Vec<JoinHandle<()>>,
    /// Reply for the `start_host` / `join_room` request still in flight.
    pending: Option<oneshot::Sender<Response>>,
    /// Snapshot chunks received so far from the host.
    incoming_history: Vec<ChatEntry>,
}

impl Session {
    /// Stop every task and drop every link of the current instance.
    pub fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.links.clear();
        self.host_link = None;
        self.incoming_history.clear();
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(error_response(CODE_TRANSPORT, "session was reset"));
        }
    }

    /// Links whose handshake has completed.
    pub fn open_link_count(&self) -> usize {
        self.links
            .values()
            .filter(|l| l.remote_peer.is_some())
            .count()
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }
}

/// Tear down the current instance and return to `Idle` under a new epoch.
fn reset(state: &mut NodeState) {
    state.session.teardown();
    state.session.epoch += 1;
    state.session.role = SessionRole::Unset;
    state.session.status = SessionStatus::Idle;
    state.session.signaling = SignalingState::Offline;
    state.session.room_id = None;
    if !state.roster.is_empty() {
        state.roster.clear();
        state.emit_roster();
    }
}

/// Abandon a session that failed to come up.
fn fail_start(state: &mut NodeState, code: &str, category: &str, message: &str) {
    let line = format!("[{category}] {message}");
    state.system_log(LogLevel::Error, line.clone());
    if let Some(reply) = state.session.pending.take() {
        let _ = reply.send(error_response(code, &line));
    }
    reset(state);
    state.emit_status();
}

/// Forward one source's events into the control channel, tagged with `epoch`.
async fn forward_links(
    control: mpsc::Sender<ControlEvent>,
    epoch: u64,
    mut rx: mpsc::Receiver<LinkEvent>,
) {
    while let Some(event) = rx.recv().await {
        if control.send(ControlEvent::Link { epoch, event }).await.is_err() {
            break;
        }
    }
}

async fn forward_signals(
    control: mpsc::Sender<ControlEvent>,
    epoch: u64,
    mut rx: mpsc::Receiver<SignalEvent>,
) {
    while let Some(event) = rx.recv().await {
        if control
            .send(ControlEvent::Signal { epoch, event })
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Address guests should dial for a listener bound on `bound`.
fn advertised_addr(advertise_host: Option<&str>, bound: SocketAddr) -> String {
    match advertise_host {
        Some(host) => format!("{host}:{}", bound.port()),
        None if bound.ip().is_unspecified() => format!("127.0.0.1:{}", bound.port()),
        None => bound.to_string(),
    }
}

// ---- Host ----

/// Become the host of a (possibly requested) room. `reply` is answered once
/// the rendezvous registration succeeds or fails.
pub async fn start_host(
    state: &mut NodeState,
    room_id: Option<String>,
    reply: oneshot::Sender<Response>,
) {
    reset(state);
    state.session.role = SessionRole::Host;
    state.session.status = SessionStatus::Connecting;
    state.emit_status();
    let epoch = state.session.epoch;

    let (link_tx, link_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    let bound = match transport::listen(
        &state.config.listen,
        state.config.peer_id.clone(),
        link_tx,
    )
    .await
    {
        Ok((bound, listener)) => {
            state.session.tasks.push(listener);
            bound
        }
        Err(e) => {
            state.session.pending = Some(reply);
            fail_start(state, CODE_TRANSPORT, "network", &format!("{e:#}"));
            return;
        }
    };
    state
        .session
        .tasks
        .push(tokio::spawn(forward_links(state.control_tx(), epoch, link_rx)));

    let addr = advertised_addr(state.config.advertise_host.as_deref(), bound);
    let (signal_tx, signal_rx) = mpsc::channel(16);
    state.session.tasks.push(tokio::spawn(forward_signals(
        state.control_tx(),
        epoch,
        signal_rx,
    )));
    state.session.tasks.push(rendezvous::announce(
        AnnounceConfig {
            rendezvous: state.config.rendezvous.clone(),
            room_id,
            addr: addr.clone(),
            reconnect_interval: state.config.reconnect_interval,
            ping_interval: state.config.ping_interval,
        },
        signal_tx,
    ));
    state.session.pending = Some(reply);
    state.system_log(
        LogLevel::Info,
        format!("Listening for guests on {addr}, registering room..."),
    );
}

pub fn on_signal_event(state: &mut NodeState, event: SignalEvent) {
    if state.session.role != SessionRole::Host {
        return;
    }
    match event {
        SignalEvent::Ready { room_id } => {
            state.session.signaling = SignalingState::Online;
            state.session.room_id = Some(room_id.clone());
            if state.session.status == SessionStatus::Connecting {
                state.session.status = SessionStatus::Connected;
                state.system_log(LogLevel::Success, format!("Room ready: {room_id}"));
                state.emit_status();
                presence::announce(state);
                if let Some(reply) = state.session.pending.take() {
                    let _ = reply.send(ok_json(&state.session_info()));
                }
            } else {
                state.system_log(LogLevel::Info, format!("Room {room_id} re-registered."));
                state.emit_status();
            }
        }
        SignalEvent::Disconnected { reason } => {
            state.session.signaling = SignalingState::Reconnecting;
            state.system_log(
                LogLevel::Warning,
                format!("Signaling connection lost ({reason}), reconnecting..."),
            );
            state.emit_status();
        }
        SignalEvent::Failed { category, message } => {
            fail_start(state, CODE_RENDEZVOUS, &category, &message);
        }
    }
}

// ---- Guest ----

/// Join `room_id` as a guest. `reply` is answered once the host link opens
/// or the attempt fails.
pub fn start_guest(state: &mut NodeState, room_id: String, reply: oneshot::Sender<Response>) {
    reset(state);
    state.session.role = SessionRole::Guest;
    state.session.status = SessionStatus::Connecting;
    state.session.room_id = Some(room_id.clone());
    state.session.pending = Some(reply);
    state.emit_status();
    state.system_log(LogLevel::Info, format!("Joining room {room_id}..."));

    let epoch = state.session.epoch;
    let control = state.control_tx();
    let rendezvous = state.config.rendezvous.clone();
    let peer_id = state.config.peer_id.clone();
    state.session.tasks.push(tokio::spawn(async move {
        let (link_tx, link_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let result = connect_to_host(&rendezvous, &room_id, peer_id, link_tx).await;
        let connected = result.is_ok();
        if control
            .send(ControlEvent::GuestDialed { epoch, result })
            .await
            .is_err()
        {
            return;
        }
        // Link events only flow after the dial result so the control task
        // knows the host link before it can open.
        if connected {
            forward_links(control, epoch, link_rx).await;
        }
    }));
}

async fn connect_to_host(
    rendezvous: &str,
    room_id: &str,
    peer_id: String,
    link_tx: mpsc::Sender<LinkEvent>,
) -> Result<PeerLink, DialFailure> {
    let addr = rendezvous::lookup(rendezvous, room_id)
        .await
        .map_err(|e| DialFailure {
            code: CODE_RENDEZVOUS,
            category: e.category().to_string(),
            message: e.to_string(),
        })?;
    tracing::debug!(room = %room_id, addr = %addr, "room resolved, dialing host");
    transport::dial(&addr, peer_id, link_tx)
        .await
        .map_err(|e| DialFailure {
            code: CODE_TRANSPORT,
            category: "network".to_string(),
            message: format!("{e:#}"),
        })
}

pub fn on_guest_dialed(state: &mut NodeState, result: Result<PeerLink, DialFailure>) {
    if state.session.role != SessionRole::Guest {
        return;
    }
    match result {
        Ok(link) => {
            tracing::debug!(link = link.id(), remote = %link.remote_addr(), "host link dialed");
            state.session.host_link = Some(link.id());
            state.session.links.insert(
                link.id(),
                LinkState {
                    link,
                    remote_peer: None,
                },
            );
        }
        Err(f) => fail_start(state, f.code, &f.category, &f.message),
    }
}

/// Start the settle delay after which a fresh guest announces itself.
fn schedule_settle(state: &mut NodeState) {
    let epoch = state.session.epoch;
    let settle = state.config.settle;
    let control = state.control_tx();
    state.session.tasks.push(tokio::spawn(async move {
        tokio::time::sleep(settle).await;
        let _ = control.send(ControlEvent::SettleElapsed { epoch }).await;
    }));
}

// ---- Links ----

pub fn on_link_event(state: &mut NodeState, event: LinkEvent) {
    match event {
        LinkEvent::Accepted(link) => {
            if state.session.role != SessionRole::Host {
                return;
            }
            tracing::debug!(link = link.id(), remote = %link.remote_addr(), "guest connection accepted");
            state.session.links.insert(
                link.id(),
                LinkState {
                    link,
                    remote_peer: None,
                },
            );
        }
        LinkEvent::Open { link, remote_peer } => on_link_open(state, link, remote_peer),
        LinkEvent::Data { link, message } => on_link_data(state, link, message),
        LinkEvent::Closed { link } => on_link_closed(state, link),
        LinkEvent::Error { link, message } => {
            tracing::warn!(link, err = %message, "link error");
            state.system_log(LogLevel::Warning, format!("[network] {message}"));
        }
    }
}

fn on_link_open(state: &mut NodeState, link: LinkId, remote_peer: String) {
    let Some(entry) = state.session.links.get_mut(&link) else {
        tracing::debug!(link, "open for unknown link");
        return;
    };
    entry.remote_peer = Some(remote_peer.clone());
    tracing::info!(link, peer = %remote_peer, "link open");

    match state.session.role {
        SessionRole::Host => {
            for frame in wire::history_frames(state.log.entries()) {
                match frame.encode() {
                    Ok(line) => send_line_to(state, link, line),
                    // Only a single entry too large for any frame gets here.
                    Err(e) => {
                        state.system_log(LogLevel::Warning, format!("History chunk not sent: {e}"))
                    }
                }
            }
            presence::announce(state);
            for roster_entry in state.roster.entries() {
                send_to(state, link, &WireMessage::Presence {
                    payload: roster_entry,
                });
            }
            state.system_log(LogLevel::Info, format!("Guest joined ({remote_peer})."));
            state.emit_status();
        }
        SessionRole::Guest if state.session.host_link == Some(link) => {
            state.session.status = SessionStatus::Connected;
            let room = state.session.room_id.clone().unwrap_or_default();
            state.system_log(LogLevel::Success, format!("Connected to room {room}."));
            state.emit_status();
            if let Some(reply) = state.session.pending.take() {
                let _ = reply.send(ok_json(&state.session_info()));
            }
            schedule_settle(state);
        }
        _ => {}
    }
}

fn on_link_data(state: &mut NodeState, link: LinkId, message: WireMessage) {
    tracing::debug!(link, kind = message.tag(), "wire message");
    let relay = state.session.role == SessionRole::Host && message.is_relayed();
    let forwarded = relay.then(|| message.clone());
    let changed = apply(state, message);
    if let Some(message) = forwarded {
        if !changed {
            tracing::debug!(link, kind = message.tag(), "relaying message that changed nothing here");
        }
        relay_from(state, link, &message);
    }
}

fn on_link_closed(state: &mut NodeState, link: LinkId) {
    let Some(closed) = state.session.links.remove(&link) else {
        return;
    };
    tracing::info!(link, peer = ?closed.remote_peer, "link closed");
    match state.session.role {
        SessionRole::Host => {
            if let Some(peer) = closed.remote_peer {
                if state.roster.remove(&peer).is_some() {
                    state.emit_roster();
                }
                state.system_log(LogLevel::Warning, format!("Guest left ({peer})."));
            }
            state.emit_status();
        }
        SessionRole::Guest if state.session.host_link == Some(link) => {
            state.session.host_link = None;
            state.session.status = SessionStatus::Disconnected;
            state.system_log(LogLevel::Error, "Lost connection to the host.");
            if let Some(reply) = state.session.pending.take() {
                let _ = reply.send(error_response(
                    CODE_TRANSPORT,
                    "host closed the connection before the session opened",
                ));
            }
            state.emit_status();
        }
        _ => {}
    }
}

/// Apply a peer's message to local state. Returns whether anything changed.
pub fn apply(state: &mut NodeState, message: WireMessage) -> bool {
    match message {
        WireMessage::SyncHistory { history, more } => {
            state.session.incoming_history.extend(history);
            if more {
                tracing::debug!(
                    buffered = state.session.incoming_history.len(),
                    "history chunk received"
                );
                return true;
            }
            let history = std::mem::take(&mut state.session.incoming_history);
            let count = history.len();
            state.log.replace_all(history);
            state.system_log(LogLevel::Info, format!("Synced {count} messages."));
            true
        }
        WireMessage::NewMessage { payload } => {
            let is_user = payload.kind.is_user();
            let Some(index) = state.log.append_entry(payload) else {
                return false;
            };
            if is_user {
                // Mesh trigger: a peer's prompt also goes to our own agents.
                let prompt = state
                    .log
                    .get(index)
                    .map(|e| e.text.clone())
                    .unwrap_or_default();
                dispatch::distribute(state, &prompt, index);
            }
            true
        }
        WireMessage::DeleteMessage { index, entry_id } => {
            let target = match entry_id {
                Some(id) => {
                    let found = state.log.position_of(&id);
                    if found.is_none() {
                        tracing::debug!(entry_id = %id, "delete for unknown entry ignored");
                    }
                    found
                }
                None => Some(index),
            };
            target.is_some_and(|index| state.log.delete_at(index, Origin::Remote).is_some())
        }
        WireMessage::ClearSession => {
            let had_entries = !state.log.entries().is_empty();
            state.log.clear(Origin::Remote);
            had_entries
        }
        WireMessage::Presence { payload } => presence::merge(state, payload),
    }
}

fn send_to(state: &NodeState, link: LinkId, message: &WireMessage) {
    match message.encode() {
        Ok(line) => send_line_to(state, link, line),
        Err(e) => tracing::warn!(link, kind = message.tag(), err = %e, "message not sent"),
    }
}

fn send_line_to(state: &NodeState, link: LinkId, line: String) {
    if let Some(entry) = state.session.links.get(&link)
        && let Err(e) = entry.link.send_line(line)
    {
        tracing::debug!(link, err = %e, "send failed");
    }
}

/// Send `message` on every open link. A message too large for one frame is
/// kept local and reported.
pub fn broadcast(state: &mut NodeState, message: &WireMessage) {
    let line = match message.encode() {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(kind = message.tag(), err = %e, "message not shared");
            state.system_log(LogLevel::Warning, format!("Not shared with peers: {e}"));
            return;
        }
    };
    for (id, entry) in &state.session.links {
        if entry.remote_peer.is_none() {
            continue;
        }
        if let Err(e) = entry.link.send_line(line.clone()) {
            tracing::debug!(link = *id, err = %e, "broadcast send failed");
        }
    }
}

/// Forward `message` to every open link except the one it came from.
fn relay_from(state: &NodeState, from: LinkId, message: &WireMessage) {
    for (id, entry) in &state.session.links {
        if *id == from || entry.remote_peer.is_none() {
            continue;
        }
        if let Err(e) = entry.link.send(message) {
            tracing::debug!(link = *id, err = %e, "relay send failed");
        }
    }
}

/// Close the current session.
pub fn leave(state: &mut NodeState) -> Response {
    reset(state);
    state.session.status = SessionStatus::Closed;
    state.system_log(LogLevel::Info, "Session closed.");
    state.emit_status();
    ok_json(&state.session_info())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_addr_rewrites_wildcard_binds() {
        let bound: SocketAddr = "0.0.0.0:4100".parse().unwrap();
        assert_eq!(advertised_addr(None, bound), "127.0.0.1:4100");
        assert_eq!(advertised_addr(Some("10.1.2.3"), bound), "10.1.2.3:4100");

        let specific: SocketAddr = "192.168.1.5:4100".parse().unwrap();
        assert_eq!(advertised_addr(None, specific), "192.168.1.5:4100");
    }
}
