use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use parking_lot::RwLock;

use crate::session::{SessionId, SessionTransport};

/// Live client sessions and the keyword each one tracks.
///
/// A single lock guards every entry so readers always observe one consistent snapshot of the
/// filter set. The registry never owns the socket behind a transport; dropping an entry only
/// drops this handle to it.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

struct SessionEntry {
    filter: Option<String>,
    transport: Option<Arc<dyn SessionTransport>>,
    created_at: Instant,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            filter: None,
            transport: None,
            created_at: Instant::now(),
        }
    }
}

/// Lowercases and trims a client keyword. Returns `None` for keywords that would match
/// everything.
pub fn normalize_keyword(keyword: &str) -> Option<String> {
    let normalized = keyword.trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session without a filter, or replaces the transport of an existing one.
    pub fn attach(&self, session_id: SessionId, transport: Arc<dyn SessionTransport>) {
        self.sessions
            .write()
            .entry(session_id)
            .or_insert_with(SessionEntry::new)
            .transport = Some(transport);
    }

    /// Sets the session's filter, creating the session when it is unknown. A blank keyword
    /// clears the filter. Returns whether the merged filter set changed.
    pub fn register(&self, session_id: &SessionId, keyword: &str) -> bool {
        let filter = normalize_keyword(keyword);
        let mut guard = self.sessions.write();
        let before = merged_filters(&guard);
        guard
            .entry(session_id.clone())
            .or_insert_with(SessionEntry::new)
            .filter = filter;
        before != merged_filters(&guard)
    }

    /// Removes the session. Returns whether the merged filter set changed; absent ids are a
    /// no-op.
    pub fn unregister(&self, session_id: &SessionId) -> bool {
        let mut guard = self.sessions.write();
        let Some(removed) = guard.remove(session_id) else {
            return false;
        };
        match removed.filter {
            Some(filter) => !guard
                .values()
                .any(|entry| entry.filter.as_deref() == Some(filter.as_str())),
            None => false,
        }
    }

    /// Drops every session created before `taken_at` whose id is missing from `live`, the set
    /// of open sockets observed at `taken_at`. Returns whether the merged filter set changed.
    pub fn retain(&self, live: &HashSet<SessionId>, taken_at: Instant) -> bool {
        let mut guard = self.sessions.write();
        let before = merged_filters(&guard);
        guard.retain(|id, entry| live.contains(id) || entry.created_at > taken_at);
        before != merged_filters(&guard)
    }

    /// Deduplicated set of every session filter at this instant.
    pub fn snapshot_filters(&self) -> BTreeSet<String> {
        merged_filters(&self.sessions.read())
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn filter(&self, session_id: &SessionId) -> Option<String> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|entry| entry.filter.clone())
    }

    pub fn transport(&self, session_id: &SessionId) -> Option<Arc<dyn SessionTransport>> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|entry| entry.transport.clone())
    }

    /// Sessions whose filter occurs as a substring of `text`, which must already be
    /// lowercased.
    pub fn matching(&self, text: &str) -> Vec<SessionId> {
        let mut matched: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, entry)| {
                entry
                    .filter
                    .as_deref()
                    .is_some_and(|filter| text.contains(filter))
            })
            .map(|(id, _)| id.clone())
            .collect();
        matched.sort();
        matched
    }

    pub fn clear(&self) {
        self.sessions.write().clear();
    }
}

fn merged_filters(sessions: &HashMap<SessionId, SessionEntry>) -> BTreeSet<String> {
    sessions
        .values()
        .filter_map(|entry| entry.filter.clone())
        .collect()
}
