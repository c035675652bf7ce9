use super::{NodeState, session};
use roundtable::model::RosterEntry;
use roundtable::protocol::SessionRole;
use roundtable::wire::WireMessage;

/// Announce this node's presence to the session. No-op unless connected.
pub fn announce(state: &mut NodeState) {
    if !state.session.is_connected() {
        return;
    }
    let entry = RosterEntry {
        peer_id: state.config.peer_id.clone(),
        display_name: state.display_name(),
        bound_agents: state.dispatcher.bound_names(),
        is_host: state.session.role == SessionRole::Host,
    };
    tracing::debug!(name = %entry.display_name, agents = entry.bound_agents.len(), "announcing presence");
    state.roster.merge(entry.clone());
    state.emit_roster();
    session::broadcast(state, &WireMessage::Presence { payload: entry });
}

/// Record a peer's presence. Returns whether the roster changed.
pub fn merge(state: &mut NodeState, entry: RosterEntry) -> bool {
    let changed = state.roster.merge(entry);
    if changed {
        state.emit_roster();
    }
    changed
}
