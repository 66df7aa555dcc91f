//! Proxy tree contract and the id-addressed arena that implements it.
//!
//! DESIGN
//! ======
//! The collaboration core never holds references to proxied objects; it
//! names them by `ProxyId` and goes through [`ProxyTree`]. `ProxyArena` is
//! the in-process implementation: a map from stable id to state, plus an
//! optional [`MutationObserver`] told about every local property write so a
//! replication policy can mark the object dirty.

use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use crate::message::{ErrorCode, ProxyId, Variant};
use crate::scene::{SceneDocument, SceneProxy};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown object: {0}")]
    UnknownObject(ProxyId),
    #[error("proxy id already in use: {0}")]
    IdInUse(ProxyId),
}

impl ErrorCode for ProxyError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownObject(_) => "E_UNKNOWN_OBJECT",
            Self::IdInUse(_) => "E_ID_IN_USE",
        }
    }
}

/// Full state of one proxy: identity plus every property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyState {
    pub group: String,
    pub name: String,
    pub properties: BTreeMap<String, Vec<Variant>>,
}

/// Told about local mutations of proxy state.
pub trait MutationObserver {
    fn modified(&self, id: ProxyId);
}

/// Addressable object store consumed by the collaboration core.
pub trait ProxyTree {
    fn contains(&self, id: ProxyId) -> bool;

    /// Ids in ascending order.
    fn ids(&self) -> Vec<ProxyId>;

    fn create_proxy(&mut self, group: &str, name: &str) -> ProxyId;

    /// Create a proxy under an id allocated elsewhere (by the peer that
    /// created it).
    ///
    /// # Errors
    ///
    /// Returns `IdInUse` if `id` already names an object.
    fn insert_proxy(&mut self, id: ProxyId, group: &str, name: &str) -> Result<(), ProxyError>;

    /// Delete the object. Observers are told, so the deletion replicates
    /// like any other write.
    ///
    /// # Errors
    ///
    /// Returns `UnknownObject` if `id` is not in the tree.
    fn remove_proxy(&mut self, id: ProxyId) -> Result<(), ProxyError>;

    /// # Errors
    ///
    /// Returns `UnknownObject` if `id` is not in the tree.
    fn property(&self, id: ProxyId, key: &str) -> Result<Option<&[Variant]>, ProxyError>;

    /// # Errors
    ///
    /// Returns `UnknownObject` if `id` is not in the tree.
    fn set_property(&mut self, id: ProxyId, key: &str, values: Vec<Variant>) -> Result<(), ProxyError>;

    /// # Errors
    ///
    /// Returns `UnknownObject` if `id` is not in the tree.
    fn snapshot(&self, id: ProxyId) -> Result<ProxyState, ProxyError>;

    /// Overwrite the object's whole state.
    ///
    /// # Errors
    ///
    /// Returns `UnknownObject` if `id` is not in the tree.
    fn restore(&mut self, id: ProxyId, state: ProxyState) -> Result<(), ProxyError>;

    /// Flag the object as needing a recompute. Does not pull data.
    ///
    /// # Errors
    ///
    /// Returns `UnknownObject` if `id` is not in the tree.
    fn mark_modified(&mut self, id: ProxyId) -> Result<(), ProxyError>;

    /// Recompute the object.
    ///
    /// # Errors
    ///
    /// Returns `UnknownObject` if `id` is not in the tree.
    fn update(&mut self, id: ProxyId) -> Result<(), ProxyError>;

    fn clear(&mut self);

    fn save_document(&self) -> SceneDocument {
        let proxies = self
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.snapshot(id).ok().map(|state| SceneProxy {
                    id,
                    group: state.group,
                    name: state.name,
                    properties: state.properties,
                })
            })
            .collect();
        SceneDocument { proxies }
    }

    /// Create one proxy per document entry. Returns `(document id, new id)`
    /// pairs in document order.
    fn load_document(&mut self, doc: &SceneDocument) -> Vec<(ProxyId, ProxyId)> {
        let mut mapping = Vec::with_capacity(doc.proxies.len());
        for proxy in &doc.proxies {
            let local = self.create_proxy(&proxy.group, &proxy.name);
            let state = ProxyState {
                group: proxy.group.clone(),
                name: proxy.name.clone(),
                properties: proxy.properties.clone(),
            };
            // Freshly created, so restore cannot miss.
            let _ = self.restore(local, state);
            mapping.push((proxy.id, local));
        }
        mapping
    }
}

// =============================================================================
// ARENA
// =============================================================================

#[derive(Debug, Default)]
struct Entry {
    state: ProxyState,
    modified: u64,
    updates: u64,
    needs_update: bool,
}

/// Arena of proxies addressed by stable integer id.
pub struct ProxyArena {
    entries: BTreeMap<ProxyId, Entry>,
    next_id: ProxyId,
    observer: Option<Rc<dyn MutationObserver>>,
}

impl Default for ProxyArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyArena {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Arena whose first allocated id is `first_id`.
    #[must_use]
    pub fn starting_at(first_id: ProxyId) -> Self {
        Self { entries: BTreeMap::new(), next_id: first_id, observer: None }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Rc<dyn MutationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of `mark_modified` calls seen by the object.
    #[must_use]
    pub fn modified_count(&self, id: ProxyId) -> u64 {
        self.entries.get(&id).map_or(0, |e| e.modified)
    }

    /// Number of `update` calls seen by the object.
    #[must_use]
    pub fn update_count(&self, id: ProxyId) -> u64 {
        self.entries.get(&id).map_or(0, |e| e.updates)
    }

    /// Marked modified and not updated since.
    #[must_use]
    pub fn needs_update(&self, id: ProxyId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.needs_update)
    }

    fn entry_mut(&mut self, id: ProxyId) -> Result<&mut Entry, ProxyError> {
        self.entries.get_mut(&id).ok_or(ProxyError::UnknownObject(id))
    }

    fn notify(&self, id: ProxyId) {
        if let Some(observer) = &self.observer {
            observer.modified(id);
        }
    }
}

impl ProxyTree for ProxyArena {
    fn contains(&self, id: ProxyId) -> bool {
        self.entries.contains_key(&id)
    }

    fn ids(&self) -> Vec<ProxyId> {
        self.entries.keys().copied().collect()
    }

    fn create_proxy(&mut self, group: &str, name: &str) -> ProxyId {
        let id = self.next_id;
        self.next_id += 1;
        let state = ProxyState { group: group.to_owned(), name: name.to_owned(), properties: BTreeMap::new() };
        self.entries.insert(id, Entry { state, ..Entry::default() });
        debug!(proxy_id = id, group, name, "proxy created");
        self.notify(id);
        id
    }

    fn insert_proxy(&mut self, id: ProxyId, group: &str, name: &str) -> Result<(), ProxyError> {
        if self.entries.contains_key(&id) {
            return Err(ProxyError::IdInUse(id));
        }
        let state = ProxyState { group: group.to_owned(), name: name.to_owned(), properties: BTreeMap::new() };
        self.entries.insert(id, Entry { state, ..Entry::default() });
        self.next_id = self.next_id.max(id.saturating_add(1));
        debug!(proxy_id = id, group, name, "proxy adopted");
        self.notify(id);
        Ok(())
    }

    fn remove_proxy(&mut self, id: ProxyId) -> Result<(), ProxyError> {
        self.entries.remove(&id).ok_or(ProxyError::UnknownObject(id))?;
        debug!(proxy_id = id, "proxy removed");
        self.notify(id);
        Ok(())
    }

    fn property(&self, id: ProxyId, key: &str) -> Result<Option<&[Variant]>, ProxyError> {
        let entry = self.entries.get(&id).ok_or(ProxyError::UnknownObject(id))?;
        Ok(entry.state.properties.get(key).map(Vec::as_slice))
    }

    fn set_property(&mut self, id: ProxyId, key: &str, values: Vec<Variant>) -> Result<(), ProxyError> {
        self.entry_mut(id)?.state.properties.insert(key.to_owned(), values);
        self.notify(id);
        Ok(())
    }

    fn snapshot(&self, id: ProxyId) -> Result<ProxyState, ProxyError> {
        self.entries
            .get(&id)
            .map(|e| e.state.clone())
            .ok_or(ProxyError::UnknownObject(id))
    }

    fn restore(&mut self, id: ProxyId, state: ProxyState) -> Result<(), ProxyError> {
        self.entry_mut(id)?.state = state;
        self.notify(id);
        Ok(())
    }

    fn mark_modified(&mut self, id: ProxyId) -> Result<(), ProxyError> {
        let entry = self.entry_mut(id)?;
        entry.modified += 1;
        entry.needs_update = true;
        Ok(())
    }

    fn update(&mut self, id: ProxyId) -> Result<(), ProxyError> {
        let entry = self.entry_mut(id)?;
        entry.updates += 1;
        entry.needs_update = false;
        Ok(())
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[path = "proxy_test.rs"]
mod tests;
