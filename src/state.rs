//! Coordinator-side view of every discovered entry.
//!
//! Background tasks never touch entries directly. They emit
//! `(TunnelKey, TunnelState)` notifications and the board, owned by the
//! coordinator loop, applies them.

use crate::entry::{Entry, TunnelKey, TunnelState};
use crate::tunnel::TunnelManager;

#[derive(Debug, Default)]
pub struct TunnelBoard {
    entries: Vec<Entry>,
}

impl TunnelBoard {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, key: &TunnelKey) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key() == *key)
    }

    /// Record a state change. Returns the updated entry, or None for a key
    /// the board does not know.
    pub fn apply(&mut self, key: &TunnelKey, state: TunnelState) -> Option<&Entry> {
        let entry = self.entries.iter_mut().find(|e| e.key() == *key)?;
        match &state {
            TunnelState::Connected { remote_addr, .. } => {
                entry.remote_addr = Some(remote_addr.clone());
            }
            TunnelState::Disconnected | TunnelState::Idle => entry.remote_addr = None,
            _ => {}
        }
        tracing::debug!("{}: {} -> {}", key, entry.state.label(), state.label());
        entry.state = state;
        Some(&*entry)
    }

    /// Entries still shown as connected whose tunnel the manager no longer
    /// holds.
    pub async fn due_for_reconnect(&self, manager: &TunnelManager) -> Vec<Entry> {
        let mut due = Vec::new();
        for entry in self.entries.iter().filter(|e| e.state.is_connected()) {
            if !manager.is_registered(&entry.key()).await {
                due.push(entry.clone());
            }
        }
        due
    }

    /// Entries for the given keys, in key order. Unknown keys are skipped.
    pub fn select(&self, keys: &[TunnelKey]) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| keys.contains(&e.key()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(host: &str, tenant: &str, port: u16) -> Entry {
        let mut e = Entry::new("prod", host, host, "/docker", tenant);
        e.local_port = port;
        e
    }

    fn connected(remote: &str) -> TunnelState {
        TunnelState::Connected {
            local_addr: "127.0.0.1:10001".to_string(),
            remote_addr: remote.to_string(),
        }
    }

    #[test]
    fn test_apply_tracks_remote_addr() {
        let mut board = TunnelBoard::new(vec![entry("db1", "a", 10001)]);
        let key = TunnelKey::new("db1", "a");

        let e = board.apply(&key, connected("172.18.0.2")).unwrap();
        assert_eq!(e.remote_addr.as_deref(), Some("172.18.0.2"));
        assert!(e.state.is_connected());

        let e = board.apply(&key, TunnelState::Disconnected).unwrap();
        assert!(e.remote_addr.is_none());
        assert_eq!(e.state, TunnelState::Disconnected);

        assert!(board
            .apply(&TunnelKey::new("db9", "x"), TunnelState::Connecting)
            .is_none());
    }

    #[test]
    fn test_select_autoconnect_keys() {
        let board = TunnelBoard::new(vec![
            entry("db1", "a", 10001),
            entry("db1", "b", 10002),
            entry("db2", "a", 10003),
        ]);
        let picked = board.select(&[TunnelKey::new("db2", "a"), TunnelKey::new("db9", "z")]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].local_port, 10003);
    }
}
