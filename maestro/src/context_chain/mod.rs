//! Append-only record of everything produced while processing one event.
//!
//! A chain is scoped to a single run and exclusively owned by the executor
//! driving that run. Items are never mutated or removed; an error is
//! represented as an additional item. Each append extends a SHA-256 hash
//! chain so integrity can be verified after the fact.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{ContextItem, ContextItemId, Event, EventId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("context item '{0}' already exists in the chain")]
    DuplicateItem(ContextItemId),
}

/// Ordered, append-only sequence of context items for one event's run.
#[derive(Debug, Clone)]
pub struct ContextChain {
    event_id: EventId,
    items: Vec<ContextItem>,
    ids: HashSet<ContextItemId>,
    hash_chain: Vec<String>,
}

impl ContextChain {
    /// Create an empty chain for the given event.
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            items: Vec::new(),
            ids: HashSet::new(),
            hash_chain: Vec::new(),
        }
    }

    /// Create a chain seeded with one item derived from the event.
    pub fn seeded_from(event: &Event) -> Self {
        let mut chain = Self::new(event.id.clone());
        // The seed id is freshly generated, so this append cannot collide.
        let _ = chain.append(ContextItem::from_event(event));
        chain
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Append one item. Fails if its id already exists in the chain.
    pub fn append(&mut self, item: ContextItem) -> Result<(), ChainError> {
        if !self.ids.insert(item.id.clone()) {
            return Err(ChainError::DuplicateItem(item.id));
        }
        let item_hash = Self::item_hash(&item);
        let chain_hash = self.next_chain_hash(&item_hash);
        log::debug!(
            "[ContextChain] append event={} item={} kind={}",
            self.event_id,
            item.id,
            item.kind()
        );
        self.items.push(item);
        self.hash_chain.push(chain_hash);
        Ok(())
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn last(&self) -> Option<&ContextItem> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items carrying the given type tag, in chain order.
    pub fn items_of_kind(&self, kind: &str) -> Vec<&ContextItem> {
        self.items.iter().filter(|i| i.kind() == kind).collect()
    }

    /// Recompute the hash chain and compare it to the stored one.
    pub fn verify_integrity(&self) -> bool {
        let mut last: Option<&String> = None;
        for (i, item) in self.items.iter().enumerate() {
            let item_hash = Self::item_hash(item);
            let mut hasher = Sha256::new();
            if let Some(prev) = last {
                hasher.update(prev.as_bytes());
            }
            hasher.update(item_hash.as_bytes());
            let expected = format!("{:x}", hasher.finalize());
            if self.hash_chain[i] != expected {
                return false;
            }
            last = Some(&self.hash_chain[i]);
        }
        true
    }

    fn item_hash(item: &ContextItem) -> String {
        let mut hasher = Sha256::new();
        hasher.update(item.id.as_bytes());
        hasher.update(item.plugin_id.as_bytes());
        hasher.update(item.action.as_bytes());
        hasher.update(item.timestamp.to_string().as_bytes());
        hasher.update(format!("{:?}", item.body).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn next_chain_hash(&self, item_hash: &str) -> String {
        let mut hasher = Sha256::new();
        if let Some(prev) = self.hash_chain.last() {
            hasher.update(prev.as_bytes());
        }
        hasher.update(item_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
