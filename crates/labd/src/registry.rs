//! Running and recent session bookkeeping.
//!
//! Running sessions are keyed by working directory (URL for sessions
//! without one), so there is at most one entry per folder. The recent list
//! is most-recent first, deduplicated by the same key, and capped. Both are
//! written through to the [`SessionStore`] on every change.
//!
//! Changes to the running list always take effect in memory. A failed write
//! is logged and retried with the next flush, so callers still get the
//! sessions they have to clean up after.

use log::{debug, info, warn};

use crate::session::{ServerItem, Session};
use crate::store::{SessionStore, StoreError, RECENT_KEY, RUNNING_KEY};

/// Recent entries kept when no cap is configured.
pub const DEFAULT_MAX_RECENT: usize = 20;

pub struct SessionRegistry {
    store: SessionStore,
    running: Vec<Session>,
    recent: Vec<ServerItem>,
    max_recent: usize,
}

impl SessionRegistry {
    /// Create a registry over `store`, loading the persisted recent list.
    ///
    /// Running entries are not loaded here; they have to be re-validated
    /// first (see [`SessionRegistry::load_running`]).
    pub fn new(store: SessionStore, max_recent: usize) -> Result<Self, StoreError> {
        let mut registry = Self {
            store,
            running: Vec::new(),
            recent: Vec::new(),
            max_recent: max_recent.max(1),
        };
        registry.recent = registry.load_recent()?;
        Ok(registry)
    }

    /// Read the recent list from the store, deduplicated and capped.
    pub fn load_recent(&self) -> Result<Vec<ServerItem>, StoreError> {
        let mut items = Vec::new();
        for item in self.store.load_items(RECENT_KEY)? {
            push_unique(&mut items, item);
        }
        items.truncate(self.max_recent);
        Ok(items)
    }

    /// Read the running cache written by a previous daemon run.
    pub fn load_running(&self) -> Result<Vec<ServerItem>, StoreError> {
        self.store.load_items(RUNNING_KEY)
    }

    /// Add or replace the running session with the same key.
    ///
    /// Returns the entry it superseded.
    pub fn record_running(&mut self, session: Session) -> Option<Session> {
        let key = session.key();
        let previous = match self.running.iter().position(|s| s.key() == key) {
            Some(index) => Some(std::mem::replace(&mut self.running[index], session)),
            None => {
                self.running.push(session);
                None
            }
        };
        debug!("[registry] Recorded running session {}", key);
        self.flush_running_logged();
        previous
    }

    /// Remove the running session with `key`.
    pub fn remove_running(&mut self, key: &str) -> Option<Session> {
        let index = self.running.iter().position(|s| s.key() == key)?;
        let removed = self.running.remove(index);
        info!("[registry] Removed running session {}", key);
        self.flush_running_logged();
        Some(removed)
    }

    pub fn get_running(&self, key: &str) -> Option<&Session> {
        self.running.iter().find(|s| s.key() == key)
    }

    pub fn get_running_mut(&mut self, key: &str) -> Option<&mut Session> {
        self.running.iter_mut().find(|s| s.key() == key)
    }

    pub fn running(&self) -> &[Session] {
        &self.running
    }

    /// Put `item` at the head of the recent list, dropping any older entry
    /// with the same key and anything past the cap.
    pub fn append_recent(&mut self, item: ServerItem) -> Result<(), StoreError> {
        self.recent.retain(|existing| existing.key() != item.key());
        self.recent.insert(0, item);
        self.recent.truncate(self.max_recent);
        self.store.save_items(RECENT_KEY, &self.recent)
    }

    pub fn recent(&self) -> &[ServerItem] {
        &self.recent
    }

    /// Persist the running list as it is now.
    pub fn flush_running(&mut self) -> Result<(), StoreError> {
        let items: Vec<ServerItem> = self.running.iter().map(Session::to_item).collect();
        self.store.save_items(RUNNING_KEY, &items)
    }

    fn flush_running_logged(&mut self) {
        if let Err(e) = self.flush_running() {
            warn!("[registry] Failed to persist running sessions: {}", e);
        }
    }
}

/// Append unless an entry with the same key is already present.
fn push_unique(items: &mut Vec<ServerItem>, item: ServerItem) {
    if !items.iter().any(|existing| existing.key() == item.key()) {
        items.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{connect_url, SessionOrigin};
    use crate::store::{FailingBackend, MemoryBackend};

    fn item(folder: &str, port: u16) -> ServerItem {
        ServerItem::local(&connect_url(port, "t").unwrap(), std::path::Path::new(folder))
    }

    fn session(folder: &str, port: u16) -> Session {
        let mut session = Session::from_item(&item(folder, port), SessionOrigin::Adopted).unwrap();
        session.state = crate::session::SessionState::Running;
        session
    }

    fn registry(backend: &MemoryBackend, max_recent: usize) -> SessionRegistry {
        SessionRegistry::new(SessionStore::new(backend.clone()), max_recent).unwrap()
    }

    #[test]
    fn test_append_recent_is_idempotent() {
        let backend = MemoryBackend::new();
        let mut reg = registry(&backend, DEFAULT_MAX_RECENT);

        reg.append_recent(item("/home/u/a", 1)).unwrap();
        let once = reg.recent().to_vec();
        reg.append_recent(item("/home/u/a", 1)).unwrap();
        assert_eq!(reg.recent(), once.as_slice());
    }

    #[test]
    fn test_append_recent_moves_to_head() {
        let backend = MemoryBackend::new();
        let mut reg = registry(&backend, DEFAULT_MAX_RECENT);

        reg.append_recent(item("/a", 1)).unwrap();
        reg.append_recent(item("/b", 2)).unwrap();
        reg.append_recent(item("/a", 3)).unwrap();

        let keys: Vec<&str> = reg.recent().iter().map(ServerItem::key).collect();
        assert_eq!(keys, vec!["/a", "/b"]);
        // The newer link replaces the old one.
        assert!(reg.recent()[0].link.contains(":3/"));
    }

    #[test]
    fn test_recent_cap_evicts_oldest() {
        let backend = MemoryBackend::new();
        let mut reg = registry(&backend, 3);
        for (i, folder) in ["/1", "/2", "/3", "/4"].iter().enumerate() {
            reg.append_recent(item(folder, i as u16 + 1)).unwrap();
        }
        let keys: Vec<&str> = reg.recent().iter().map(ServerItem::key).collect();
        assert_eq!(keys, vec!["/4", "/3", "/2"]);
    }

    #[test]
    fn test_recent_survives_reload() {
        let backend = MemoryBackend::new();
        {
            let mut reg = registry(&backend, DEFAULT_MAX_RECENT);
            reg.append_recent(item("/x", 1)).unwrap();
            reg.append_recent(item("/y", 2)).unwrap();
        }
        let reg = registry(&backend, DEFAULT_MAX_RECENT);
        let keys: Vec<&str> = reg.recent().iter().map(ServerItem::key).collect();
        assert_eq!(keys, vec!["/y", "/x"]);
    }

    #[test]
    fn test_record_running_replaces_same_folder() {
        let backend = MemoryBackend::new();
        let mut reg = registry(&backend, DEFAULT_MAX_RECENT);

        assert!(reg.record_running(session("/p", 1)).is_none());
        let previous = reg.record_running(session("/p", 2));
        assert_eq!(previous.and_then(|s| s.port), Some(1));
        assert_eq!(reg.running().len(), 1);
        assert_eq!(reg.get_running("/p").and_then(|s| s.port), Some(2));

        assert_eq!(reg.load_running().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_running_flushes() {
        let backend = MemoryBackend::new();
        let mut reg = registry(&backend, DEFAULT_MAX_RECENT);
        reg.record_running(session("/p", 1));
        reg.record_running(session("/q", 2));

        assert!(reg.remove_running("/p").is_some());
        assert!(reg.remove_running("/p").is_none());

        let stored = reg.load_running().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].key(), "/q");
    }

    #[test]
    fn test_remove_running_survives_write_failure() {
        let backend = FailingBackend::new();
        let mut reg =
            SessionRegistry::new(SessionStore::new(backend.clone()), DEFAULT_MAX_RECENT).unwrap();
        reg.record_running(session("/p", 1));

        backend.set_failing(true);
        let removed = reg.remove_running("/p");
        assert_eq!(removed.and_then(|s| s.port), Some(1));
        assert!(reg.running().is_empty());

        // The next successful flush catches the store up.
        backend.set_failing(false);
        reg.flush_running().unwrap();
        assert!(reg.load_running().unwrap().is_empty());
    }
}
