use super::{
    CODE_CONFIRMATION_REQUIRED, CODE_INVALID_REQUEST, CODE_NOT_FOUND, NodeState, dispatch,
    error_response, ok_json, ok_response, presence, session,
};
use crate::adapters::ROLL_CALL_PROMPT;
use roundtable::model::{ChatEntry, EntryKind};
use roundtable::protocol::{LogLevel, PromptResult, Response};
use roundtable::wire::WireMessage;
use roundtable_mesh::chat_log::Origin;
use roundtable_mesh::store::KEY_USERNAME;

/// Append a local prompt, share it with the session and hand it to the
/// enabled agents.
pub fn handle_send_prompt(state: &mut NodeState, text: &str) -> Response {
    let sender = state.sender_name();
    let candidate = WireMessage::NewMessage {
        payload: ChatEntry::new(sender.as_str(), text, EntryKind::User),
    };
    if let Err(e) = candidate.encode() {
        return error_response(CODE_INVALID_REQUEST, &format!("prompt is too large: {e}"));
    }
    let Some(index) = state.log.append(&sender, text, EntryKind::User) else {
        return error_response(CODE_INVALID_REQUEST, "prompt is empty");
    };
    let Some(entry) = state.log.get(index).cloned() else {
        return error_response(CODE_NOT_FOUND, "prompt vanished from the log");
    };
    session::broadcast(state, &WireMessage::NewMessage {
        payload: entry.clone(),
    });
    let dispatched = dispatch::distribute(state, &entry.text, index);
    ok_json(&PromptResult {
        index,
        entry_id: entry.id,
        dispatched,
    })
}

pub fn handle_roll_call(state: &mut NodeState) -> Response {
    state.system_log(LogLevel::Info, "Starting roll call...");
    handle_send_prompt(state, ROLL_CALL_PROMPT)
}

/// Edit an entry locally. Edits are not shared with peers.
pub fn handle_edit(state: &mut NodeState, index: usize, text: &str) -> Response {
    if state.log.get(index).is_none() {
        return error_response(CODE_NOT_FOUND, &format!("no message at index {index}"));
    }
    if !state.log.edit_text(index, text) {
        return error_response(CODE_INVALID_REQUEST, "new text is empty or unchanged");
    }
    match state.log.get(index) {
        Some(entry) => ok_json(entry),
        None => ok_response(None),
    }
}

pub fn handle_delete(state: &mut NodeState, index: usize, confirm: bool) -> Response {
    let Some(entry_id) = state.log.get(index).map(|e| e.id.clone()) else {
        return error_response(CODE_NOT_FOUND, &format!("no message at index {index}"));
    };
    if !confirm {
        return error_response(
            CODE_CONFIRMATION_REQUIRED,
            "deleting a message requires confirmation",
        );
    }
    if state
        .log
        .delete_at(index, Origin::Local { confirmed: true })
        .is_none()
    {
        return error_response(CODE_NOT_FOUND, &format!("no message at index {index}"));
    }
    session::broadcast(state, &WireMessage::DeleteMessage {
        index,
        entry_id: Some(entry_id.clone()),
    });
    ok_response(Some(serde_json::json!({ "index": index, "entry_id": entry_id })))
}

pub fn handle_clear(state: &mut NodeState, confirm: bool) -> Response {
    if !confirm {
        return error_response(
            CODE_CONFIRMATION_REQUIRED,
            "clearing the session requires confirmation",
        );
    }
    state.log.clear(Origin::Local { confirmed: true });
    session::broadcast(state, &WireMessage::ClearSession);
    state.system_log(LogLevel::Info, "Session history cleared.");
    ok_response(None)
}

pub fn handle_set_username(state: &mut NodeState, username: &str) -> Response {
    let username = username.trim().to_string();
    if let Err(e) = state
        .store
        .set(KEY_USERNAME, serde_json::Value::String(username.clone()))
    {
        tracing::warn!(err = %e, "failed to persist username");
    }
    state.username = username;
    state.system_log(
        LogLevel::Info,
        format!("Display name is now {}.", state.display_name()),
    );
    presence::announce(state);
    ok_json(&state.session_info())
}
