//! Agent dispatch: prompt distribution with context injection, reply
//! harvesting, and endpoint discovery.

use super::{
    CODE_NO_AGENTS, CODE_NOT_FOUND, ControlEvent, NodeState, error_response, ok_json, presence,
    session,
};
use crate::adapters::{
    AdapterError, AgentAdapter, DistributeOutcome, EndpointAdapter, HarvestOutcome, match_profile,
};
use roundtable::ENDPOINT_GROUP_LABEL;
use roundtable::model::{ChatEntry, EntryKind};
use roundtable::protocol::{AgentInfo, ContextOptions, HarvestResult, LogLevel, Response};
use roundtable::wire::WireMessage;
use roundtable_mesh::chat_log::clean_text;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::oneshot;

const CONTEXT_HEADER: &str = "\n\n--- PREVIOUS ROUNDTABLE CONTEXT ---\n";
const CONTEXT_FOOTER: &str = "--- END CONTEXT ---\n(Resuming discussion...)\n\n";

/// An adapter bound to this node.
#[derive(Clone)]
pub struct Binding {
    /// Catalogue key; also the entry kind of this agent's replies.
    pub key: String,
    /// Display name; the sender of this agent's replies.
    pub name: String,
    /// Endpoint id the adapter talks to.
    pub endpoint: String,
    pub adapter: Arc<dyn AgentAdapter>,
    pub enabled: bool,
}

/// Result of one adapter task, reported back to the control task.
pub enum AdapterOutcome {
    Distributed {
        agent: String,
        name: String,
        result: Result<DistributeOutcome, AdapterError>,
    },
    Harvested {
        agent: String,
        name: String,
        result: Result<HarvestOutcome, AdapterError>,
    },
}

/// Bound adapters and context options.
#[derive(Default)]
pub struct Dispatcher {
    bindings: BTreeMap<String, Binding>,
    options: ContextOptions,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, binding: Binding) {
        if let Some(previous) = self.bindings.insert(binding.key.clone(), binding) {
            tracing::debug!(agent = %previous.key, endpoint = %previous.endpoint, "replaced agent binding");
        }
    }

    /// Replace every binding.
    pub fn rebind(&mut self, bindings: Vec<Binding>) {
        self.bindings.clear();
        for binding in bindings {
            self.bind(binding);
        }
    }

    /// Enable or disable an agent by key or display name. Returns the agent's
    /// display name, or `None` if nothing matched.
    pub fn set_enabled(&mut self, agent: &str, enabled: bool) -> Option<String> {
        let binding = self.bindings.values_mut().find(|b| {
            b.key.eq_ignore_ascii_case(agent) || b.name.eq_ignore_ascii_case(agent)
        })?;
        binding.enabled = enabled;
        Some(binding.name.clone())
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        self.bindings
            .values()
            .map(|b| AgentInfo {
                key: b.key.clone(),
                name: b.name.clone(),
                endpoint: b.endpoint.clone(),
                enabled: b.enabled,
            })
            .collect()
    }

    /// Names of the enabled agents, as announced in presence.
    pub fn bound_names(&self) -> BTreeSet<String> {
        self.enabled().map(|b| b.name.clone()).collect()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.values().filter(|b| b.enabled)
    }

    pub fn options(&self) -> ContextOptions {
        self.options
    }
}

/// Context prepended to a prompt for `target_name`.
///
/// With smart context on, the target's own earlier replies are left out.
/// Empty when history is off or nothing remains.
pub fn context_block(entries: &[ChatEntry], target_name: &str, options: ContextOptions) -> String {
    if !options.include_history {
        return String::new();
    }
    let mut body = String::new();
    for entry in entries {
        if options.smart_context && entry.sender == target_name {
            continue;
        }
        body.push_str(&format!("[{}]: {}\n\n", entry.sender, entry.text));
    }
    if body.is_empty() {
        return String::new();
    }
    format!("{CONTEXT_HEADER}{body}{CONTEXT_FOOTER}")
}

/// Send `prompt` to every enabled agent, each with context built from the
/// `prior` entries that precede it. Returns the agents dispatched to.
pub fn distribute(state: &mut NodeState, prompt: &str, prior: usize) -> Vec<String> {
    let entries = state.log.entries();
    let history = &entries[..prior.min(entries.len())];
    let options = state.dispatcher.options();
    let mut dispatched = Vec::new();

    for binding in state.dispatcher.enabled() {
        let text = format!(
            "{}{prompt}",
            context_block(history, &binding.name, options)
        );
        let adapter = binding.adapter.clone();
        let agent = binding.key.clone();
        let name = binding.name.clone();
        let control = state.control_tx();
        dispatched.push(name.clone());
        tokio::spawn(async move {
            let result = adapter.distribute_prompt(&text).await;
            let _ = control
                .send(ControlEvent::Adapter(AdapterOutcome::Distributed {
                    agent,
                    name,
                    result,
                }))
                .await;
        });
    }
    if !dispatched.is_empty() {
        tracing::info!(agents = dispatched.len(), "prompt dispatched");
    }
    dispatched
}

pub fn handle_harvest(state: &mut NodeState) -> Response {
    let mut requested = Vec::new();
    for binding in state.dispatcher.enabled() {
        let adapter = binding.adapter.clone();
        let agent = binding.key.clone();
        let name = binding.name.clone();
        let control = state.control_tx();
        requested.push(name.clone());
        tokio::spawn(async move {
            let result = adapter.harvest_latest().await;
            let _ = control
                .send(ControlEvent::Adapter(AdapterOutcome::Harvested {
                    agent,
                    name,
                    result,
                }))
                .await;
        });
    }
    if requested.is_empty() {
        return error_response(CODE_NO_AGENTS, "no enabled agents to harvest from");
    }
    state.system_log(
        LogLevel::Info,
        format!("Harvesting from {} agents...", requested.len()),
    );
    ok_json(&HarvestResult { requested })
}

pub fn on_outcome(state: &mut NodeState, outcome: AdapterOutcome) {
    match outcome {
        AdapterOutcome::Distributed { agent, name, result } => match result {
            Ok(DistributeOutcome {
                success: true,
                warning: Some(warning),
                ..
            }) => state.system_log(LogLevel::Warning, format!("{name}: {warning}")),
            Ok(DistributeOutcome { success: true, .. }) => {
                tracing::debug!(agent = %agent, "prompt delivered");
                state.system_log(LogLevel::Info, format!("Sent to {name}."));
            }
            Ok(DistributeOutcome { error, .. }) => {
                let error = error.unwrap_or_else(|| "delivery failed".to_string());
                state.system_log(LogLevel::Error, format!("{name}: {error}"));
            }
            Err(e) => {
                tracing::warn!(agent = %agent, err = %e, "distribute failed");
                state.system_log(LogLevel::Error, format!("{name}: {e}"));
            }
        },
        AdapterOutcome::Harvested { agent, name, result } => match result {
            Ok(HarvestOutcome {
                success: true,
                text: Some(text),
                ..
            }) => record_reply(state, &agent, &name, &text),
            Ok(HarvestOutcome { success: true, .. }) => {
                state.system_log(LogLevel::Warning, format!("{name}: Empty response"));
            }
            Ok(HarvestOutcome { error, .. }) => {
                let error = error.unwrap_or_else(|| "harvest failed".to_string());
                state.system_log(LogLevel::Error, format!("{name}: {error}"));
            }
            Err(e) => {
                tracing::warn!(agent = %agent, err = %e, "harvest failed");
                state.system_log(LogLevel::Error, format!("{name}: {e}"));
            }
        },
    }
}

/// Append a harvested reply unless it repeats the agent's previous one.
fn record_reply(state: &mut NodeState, agent: &str, name: &str, text: &str) {
    let cleaned = clean_text(text);
    if cleaned.is_empty() {
        state.system_log(LogLevel::Warning, format!("{name}: Empty response"));
        return;
    }
    if state
        .log
        .last_from(name)
        .is_some_and(|last| last.text == cleaned)
    {
        state.system_log(
            LogLevel::Info,
            format!("{name}: No new response (Duplicate)"),
        );
        return;
    }
    let kind = EntryKind::Agent(agent.to_string());
    let Some(entry) = state
        .log
        .append(name, &cleaned, kind)
        .and_then(|index| state.log.get(index).cloned())
    else {
        return;
    };
    session::broadcast(state, &WireMessage::NewMessage { payload: entry });
    state.system_log(LogLevel::Success, format!("{name}: Response harvested."));
}

/// Discover agent endpoints and rebind. `reply`, when present, receives the
/// new agent list.
pub fn handle_scan(state: &mut NodeState, reply: Option<oneshot::Sender<Response>>) {
    let Some(host) = state.endpoints.clone() else {
        if let Some(reply) = reply {
            let _ = reply.send(error_response(
                CODE_NO_AGENTS,
                "no agent endpoint host configured",
            ));
        }
        return;
    };
    state.system_log(LogLevel::Info, "Scanning for agents...");
    let control = state.control_tx();
    tokio::spawn(async move {
        let mut bindings = Vec::new();
        for endpoint in host.query_endpoints().await {
            let Some(profile) = match_profile(&endpoint.url) else {
                tracing::debug!(url = %endpoint.url, "endpoint matches no known agent");
                continue;
            };
            bindings.push(Binding {
                key: profile.key.to_string(),
                name: profile.name.to_string(),
                endpoint: endpoint.id.clone(),
                adapter: Arc::new(EndpointAdapter::new(host.clone(), endpoint.id)),
                enabled: true,
            });
        }
        if !bindings.is_empty() {
            let ids: Vec<String> = bindings.iter().map(|b| b.endpoint.clone()).collect();
            host.group_endpoints(&ids, ENDPOINT_GROUP_LABEL).await;
        }
        let _ = control.send(ControlEvent::Scanned { bindings, reply }).await;
    });
}

pub fn on_scanned(
    state: &mut NodeState,
    bindings: Vec<Binding>,
    reply: Option<oneshot::Sender<Response>>,
) {
    let count = bindings.len();
    state.dispatcher.rebind(bindings);
    if count > 0 {
        state.system_log(LogLevel::Success, format!("Grouped {count} active agents."));
    } else {
        state.system_log(LogLevel::Warning, "No agent endpoints found.");
    }
    state.system_log(LogLevel::Info, "Scan complete. Ready.");
    presence::announce(state);
    if let Some(reply) = reply {
        let _ = reply.send(ok_json(&state.dispatcher.agents()));
    }
}

pub fn handle_set_enabled(state: &mut NodeState, agent: &str, enabled: bool) -> Response {
    let Some(name) = state.dispatcher.set_enabled(agent, enabled) else {
        return error_response(CODE_NOT_FOUND, &format!("no bound agent named {agent}"));
    };
    let verb = if enabled { "enabled" } else { "disabled" };
    state.system_log(LogLevel::Info, format!("{name} {verb}."));
    presence::announce(state);
    ok_json(&state.dispatcher.agents())
}

pub fn handle_context_options(
    state: &mut NodeState,
    include_history: Option<bool>,
    smart_context: Option<bool>,
) -> Response {
    if let Some(include_history) = include_history {
        state.dispatcher.options.include_history = include_history;
    }
    if let Some(smart_context) = smart_context {
        state.dispatcher.options.smart_context = smart_context;
    }
    ok_json(&state.dispatcher.options())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sender: &str, text: &str) -> ChatEntry {
        ChatEntry::new(sender, text, EntryKind::User)
    }

    #[test]
    fn context_block_lists_prior_entries() {
        let entries = vec![entry("You", "hi"), entry("Gemini", "hello there")];
        let block = context_block(&entries, "Claude", ContextOptions::default());
        assert_eq!(
            block,
            "\n\n--- PREVIOUS ROUNDTABLE CONTEXT ---\n[You]: hi\n\n[Gemini]: hello there\n\n\
             --- END CONTEXT ---\n(Resuming discussion...)\n\n"
        );
    }

    #[test]
    fn smart_context_omits_target_entries() {
        let entries = vec![entry("You", "q"), entry("Claude", "a1"), entry("Gemini", "a2")];
        let block = context_block(&entries, "Claude", ContextOptions::default());
        assert!(!block.contains("[Claude]"));
        assert!(block.contains("[Gemini]: a2"));

        let off = ContextOptions {
            smart_context: false,
            ..ContextOptions::default()
        };
        assert!(context_block(&entries, "Claude", off).contains("[Claude]: a1"));
    }

    #[test]
    fn context_block_empty_cases() {
        let options = ContextOptions::default();
        assert_eq!(context_block(&[], "Claude", options), "");
        assert_eq!(
            context_block(&[entry("Claude", "only me")], "Claude", options),
            ""
        );
        let no_history = ContextOptions {
            include_history: false,
            ..options
        };
        assert_eq!(context_block(&[entry("You", "hi")], "Claude", no_history), "");
    }
}
