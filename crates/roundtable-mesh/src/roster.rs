use roundtable::model::RosterEntry;
use std::collections::HashMap;

/// Participants of the current session, keyed by peer id.
#[derive(Debug, Default)]
pub struct Roster {
    entries: HashMap<String, RosterEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entry` under its peer id, overwriting any previous announcement.
    /// Returns whether the roster changed.
    pub fn merge(&mut self, entry: RosterEntry) -> bool {
        match self.entries.get(&entry.peer_id) {
            Some(existing) if *existing == entry => false,
            _ => {
                self.entries.insert(entry.peer_id.clone(), entry);
                true
            }
        }
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<RosterEntry> {
        self.entries.remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&RosterEntry> {
        self.entries.get(peer_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot sorted with the host first, then by display name.
    pub fn entries(&self) -> Vec<RosterEntry> {
        let mut list: Vec<RosterEntry> = self.entries.values().cloned().collect();
        list.sort_by(|a, b| {
            b.is_host
                .cmp(&a.is_host)
                .then_with(|| a.display_name.cmp(&b.display_name))
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn entry(peer: &str, name: &str, agents: &[&str], is_host: bool) -> RosterEntry {
        RosterEntry {
            peer_id: peer.to_string(),
            display_name: name.to_string(),
            bound_agents: agents.iter().map(|a| a.to_string()).collect::<BTreeSet<_>>(),
            is_host,
        }
    }

    #[test]
    fn merge_overwrites_wholesale() {
        let mut roster = Roster::new();
        assert!(roster.merge(entry("p1", "Ann", &["Claude", "Gemini"], false)));
        assert!(roster.merge(entry("p1", "Annie", &[], false)));
        let got = roster.get("p1").unwrap();
        assert_eq!(got.display_name, "Annie");
        assert!(got.bound_agents.is_empty());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut roster = Roster::new();
        assert!(roster.merge(entry("p1", "Ann", &["Claude"], true)));
        assert!(!roster.merge(entry("p1", "Ann", &["Claude"], true)));
    }

    #[test]
    fn entries_list_host_first() {
        let mut roster = Roster::new();
        roster.merge(entry("p2", "Bob", &[], false));
        roster.merge(entry("p3", "Al", &[], false));
        roster.merge(entry("p1", "Zed", &[], true));
        let names: Vec<String> = roster.entries().into_iter().map(|e| e.display_name).collect();
        assert_eq!(names, vec!["Zed", "Al", "Bob"]);
    }

    #[test]
    fn remove_and_clear() {
        let mut roster = Roster::new();
        roster.merge(entry("p1", "Ann", &[], true));
        roster.merge(entry("p2", "Bob", &[], false));
        assert!(roster.remove("p2").is_some());
        assert!(roster.remove("p2").is_none());
        roster.clear();
        assert!(roster.is_empty());
    }
}
