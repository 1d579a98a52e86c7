//! Connection map: user skeleton node -> template bone name

use std::collections::BTreeMap;

use crate::skeleton::Skeleton;

/// Association of user skeleton nodes (by scene index) to template bone names.
///
/// Several nodes may map to the same template name. A node maps to at most
/// one name; adding it again replaces the previous entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMap {
    entries: BTreeMap<usize, String>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `node` to `template_name`, replacing any prior mapping.
    pub fn insert(&mut self, node: usize, template_name: impl Into<String>) {
        self.entries.insert(node, template_name.into());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn lookup(&self, node: usize) -> Option<&str> {
        self.entries.get(&node).map(String::as_str)
    }

    pub fn contains(&self, node: usize) -> bool {
        self.entries.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by scene index
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.entries.iter().map(|(&node, name)| (node, name.as_str()))
    }

    /// Scene indices of every node mapped to `template_name`
    pub fn nodes_for<'a>(&'a self, template_name: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.entries
            .iter()
            .filter(move |(_, name)| name.as_str() == template_name)
            .map(|(&node, _)| node)
    }

    /// Map `node` and, when its parent has several children, all of its siblings.
    ///
    /// Fanning siblings out to one bone lets e.g. every finger root of a rig
    /// follow the template's hand. Returns the number of nodes mapped.
    pub fn insert_with_siblings(
        &mut self,
        skeleton: &Skeleton,
        node: usize,
        template_name: &str,
    ) -> usize {
        if skeleton.get(node).is_none() {
            return 0;
        }
        self.insert(node, template_name);
        let mut mapped = 1;

        let siblings = skeleton
            .parent_of(node)
            .and_then(|p| skeleton.get(p))
            .map(|p| p.children.clone())
            .unwrap_or_default();
        if siblings.len() > 1 {
            for sibling in siblings.into_iter().filter(|&s| s != node) {
                self.insert(sibling, template_name);
                mapped += 1;
            }
        }
        mapped
    }
}
