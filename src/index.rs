//! Associative index from tag combinations to tag nodes
//!
//! One [`TagNode`] exists per combination that was ever enqueued or
//! subscribed to. Every callback runs while the node's shard is locked, so a
//! callback may inspect and mutate its node atomically with respect to other
//! index operations on the same combination. Callbacks must not await and
//! must not call back into the index.

use crate::error::Result;
use crate::group::TagGroup;
use crate::rendezvous::{ChannelKind, Rendezvous};
use crate::tags::TagCombination;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Index entry for one combination, exact or partial
#[derive(Debug)]
pub struct TagNode {
    combination: TagCombination,
    /// Created on first exact subscription or when a group settles here
    strict: Option<Arc<Rendezvous>>,
    general: Arc<Rendezvous>,
    tag_group: Option<Arc<TagGroup>>,
}

impl TagNode {
    fn new(combination: TagCombination) -> Self {
        Self {
            combination,
            strict: None,
            general: Rendezvous::new(ChannelKind::General),
            tag_group: None,
        }
    }

    pub fn combination(&self) -> &TagCombination {
        &self.combination
    }

    /// Strict channel, created on demand
    pub fn strict_channel(&mut self) -> Arc<Rendezvous> {
        Arc::clone(
            self.strict
                .get_or_insert_with(|| Rendezvous::new(ChannelKind::Strict)),
        )
    }

    pub fn general_channel(&self) -> &Arc<Rendezvous> {
        &self.general
    }

    pub fn tag_group(&self) -> Option<&Arc<TagGroup>> {
        self.tag_group.as_ref()
    }

    pub(crate) fn set_tag_group(&mut self, group: Arc<TagGroup>) {
        self.tag_group = Some(group);
    }

    pub(crate) fn take_tag_group(&mut self) -> Option<Arc<TagGroup>> {
        self.tag_group.take()
    }

    /// No tag group, no receiver handle and no publishing worker on either channel
    pub fn is_unreferenced(&self) -> bool {
        self.tag_group.is_none()
            && self.general.is_idle()
            && self.strict.as_ref().map_or(true, |s| s.is_idle())
    }

    fn channels(&self) -> impl Iterator<Item = &Arc<Rendezvous>> {
        std::iter::once(&self.general).chain(self.strict.iter())
    }
}

/// Thread-safe map of tag nodes
#[derive(Debug, Default)]
pub struct TagIndex {
    nodes: DashMap<TagCombination, TagNode>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_found` on an existing node, or build a node, run `on_create`
    /// on it and insert it. A failing `on_create` leaves the index unchanged.
    pub fn find_or_create<R>(
        &self,
        combination: &TagCombination,
        on_create: impl FnOnce(&mut TagNode) -> Result<R>,
        on_found: impl FnOnce(&mut TagNode) -> Result<R>,
    ) -> Result<R> {
        match self.nodes.entry(combination.clone()) {
            Entry::Occupied(mut entry) => on_found(entry.get_mut()),
            Entry::Vacant(entry) => {
                let mut node = TagNode::new(combination.clone());
                let result = on_create(&mut node)?;
                entry.insert(node);
                Ok(result)
            }
        }
    }

    /// `find_or_create` with the same callback for both paths
    pub fn upsert<R>(
        &self,
        combination: &TagCombination,
        f: impl FnOnce(&mut TagNode) -> Result<R>,
    ) -> Result<R> {
        match self.nodes.entry(combination.clone()) {
            Entry::Occupied(mut entry) => f(entry.get_mut()),
            Entry::Vacant(entry) => {
                let mut node = TagNode::new(combination.clone());
                let result = f(&mut node)?;
                entry.insert(node);
                Ok(result)
            }
        }
    }

    pub fn find<R>(
        &self,
        combination: &TagCombination,
        on_found: impl FnOnce(&TagNode) -> R,
    ) -> Option<R> {
        self.nodes.get(combination).map(|node| on_found(&node))
    }

    pub fn update<R>(
        &self,
        combination: &TagCombination,
        f: impl FnOnce(&mut TagNode) -> R,
    ) -> Option<R> {
        self.nodes.get_mut(combination).map(|mut node| f(&mut node))
    }

    /// Remove the node if `can_delete` approves it. Returns whether it was removed.
    pub fn delete(
        &self,
        combination: &TagCombination,
        can_delete: impl FnOnce(&TagNode) -> bool,
    ) -> bool {
        self.nodes
            .remove_if(combination, |_, node| can_delete(node))
            .is_some()
    }

    /// Visit every node whose combination satisfies `selector`
    pub fn query(
        &self,
        selector: impl Fn(&TagCombination) -> bool,
        mut visitor: impl FnMut(&TagNode),
    ) {
        for node in self.nodes.iter() {
            if selector(node.key()) {
                visitor(node.value());
            }
        }
    }

    /// Exact-match tag group lookup
    pub fn tag_group(&self, combination: &TagCombination) -> Option<Arc<TagGroup>> {
        self.find(combination, |node| node.tag_group.clone()).flatten()
    }

    pub fn tag_groups(&self) -> Vec<Arc<TagGroup>> {
        let mut groups = Vec::new();
        self.query(|_| true, |node| {
            if let Some(group) = &node.tag_group {
                groups.push(Arc::clone(group));
            }
        });
        groups
    }

    /// Every channel held by any node
    pub(crate) fn channels(&self) -> Vec<Arc<Rendezvous>> {
        let mut channels = Vec::new();
        self.query(|_| true, |node| channels.extend(node.channels().cloned()));
        channels
    }

    pub fn contains(&self, combination: &TagCombination) -> bool {
        self.nodes.contains_key(combination)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
