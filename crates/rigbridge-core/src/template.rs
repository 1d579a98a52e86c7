//! Template tree: the device's fixed anatomical bone hierarchy

use glam::Mat4;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::device::{DeviceError, DeviceService};

/// Reserved template name of the hips bone, the anchor of the root group
pub const HIPS: &str = "hips_bb_";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Device query failed while loading template: {0}")]
    Device(#[from] DeviceError),
    #[error("Duplicate template bone id: {0}")]
    DuplicateId(usize),
}

/// A bone of the template tree
#[derive(Debug, Clone)]
pub struct TemplateNode {
    /// Device bone index, unique within the tree
    pub id: usize,
    pub name: String,
    /// Parent bone id (None for the root)
    pub parent: Option<usize>,
    /// Child bone ids in device order
    pub children: Vec<usize>,
    pub local_matrix: Mat4,
}

/// Immutable template tree stored as an arena in pre-order
#[derive(Debug, Clone, Default)]
pub struct TemplateTree {
    nodes: Vec<TemplateNode>,
    by_id: HashMap<usize, usize>,
}

impl TemplateTree {
    /// Load the tree by walking the device's template queries from the root.
    pub fn load<D: DeviceService + ?Sized>(device: &D) -> Result<Self, TemplateError> {
        let root = device.template_root()?;
        let mut tree = Self::default();
        let mut visited = HashSet::new();
        tree.load_recursive(device, root, None, &mut visited)?;
        debug!(bones = tree.len(), "Loaded template tree");
        Ok(tree)
    }

    fn load_recursive<D: DeviceService + ?Sized>(
        &mut self,
        device: &D,
        index: usize,
        parent: Option<usize>,
        visited: &mut HashSet<usize>,
    ) -> Result<(), TemplateError> {
        visited.insert(index);
        let name = device.template_name(index)?;
        let local_matrix = device.template_local_matrix(index)?;
        self.push(TemplateNode {
            id: index,
            name,
            parent,
            children: Vec::new(),
            local_matrix,
        })?;

        for child in device.template_children(index)? {
            if visited.contains(&child) {
                warn!(bone = index, child, "Template reported an already visited child, skipping");
                continue;
            }
            self.load_recursive(device, child, Some(index), visited)?;
        }
        Ok(())
    }

    /// Build a tree from `(id, name, parent)` triples listed parents first.
    pub fn from_nodes<'a>(
        nodes: impl IntoIterator<Item = (usize, &'a str, Option<usize>)>,
    ) -> Result<Self, TemplateError> {
        let mut tree = Self::default();
        for (id, name, parent) in nodes {
            tree.push(TemplateNode {
                id,
                name: name.to_string(),
                parent,
                children: Vec::new(),
                local_matrix: Mat4::IDENTITY,
            })?;
        }
        Ok(tree)
    }

    fn push(&mut self, node: TemplateNode) -> Result<(), TemplateError> {
        if self.by_id.contains_key(&node.id) {
            return Err(TemplateError::DuplicateId(node.id));
        }
        if let Some(parent) = node.parent.and_then(|p| self.by_id.get(&p).copied()) {
            self.nodes[parent].children.push(node.id);
        }
        self.by_id.insert(node.id, self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All bones in pre-order (every ancestor precedes its descendants)
    pub fn nodes(&self) -> &[TemplateNode] {
        &self.nodes
    }

    pub fn root(&self) -> Option<&TemplateNode> {
        self.nodes.first()
    }

    pub fn get(&self, id: usize) -> Option<&TemplateNode> {
        self.by_id.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn find(&self, name: &str) -> Option<&TemplateNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn parent(&self, node: &TemplateNode) -> Option<&TemplateNode> {
        node.parent.and_then(|p| self.get(p))
    }

    pub fn first_child(&self, node: &TemplateNode) -> Option<&TemplateNode> {
        node.children.first().and_then(|&c| self.get(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stub::StubDevice;

    fn sample() -> TemplateTree {
        TemplateTree::from_nodes([
            (0, HIPS, None),
            (1, "spine_bb_", Some(0)),
            (2, "spine1_bb_", Some(1)),
            (3, "leftupleg_bb_", Some(0)),
            (4, "leftleg_bb_", Some(3)),
        ])
        .unwrap()
    }

    #[test]
    fn test_parent_child_links() {
        let tree = sample();
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.root().unwrap().name, HIPS);

        let root = tree.root().unwrap();
        assert_eq!(root.children, vec![1, 3]);
        assert!(tree.parent(root).is_none());

        // Every non-root bone has exactly one parent that lists it as a child
        for node in tree.nodes().iter().skip(1) {
            let parent = tree.parent(node).unwrap();
            let count = tree
                .nodes()
                .iter()
                .filter(|n| n.children.contains(&node.id))
                .count();
            assert_eq!(count, 1);
            assert!(parent.children.contains(&node.id));
        }
    }

    #[test]
    fn test_find_and_first_child() {
        let tree = sample();
        let upleg = tree.find("leftupleg_bb_").unwrap();
        assert_eq!(upleg.id, 3);
        assert_eq!(tree.first_child(upleg).unwrap().name, "leftleg_bb_");
        assert!(tree.find("head_bb_").is_none());
    }

    #[test]
    fn test_load_skips_cyclic_children() {
        // The root lists itself, the child lists itself and the root
        let device = StubDevice::new(vec![(HIPS, vec![0, 1]), ("spine_bb_", vec![1, 0])]);
        let tree = TemplateTree::load(&device).unwrap();

        assert_eq!(tree.len(), 2);
        let root = tree.root().unwrap();
        assert_eq!(root.id, 0);
        assert_eq!(root.children, vec![1]);
        let spine = tree.find("spine_bb_").unwrap();
        assert_eq!(spine.parent, Some(0));
        assert!(spine.children.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = TemplateTree::from_nodes([(0, HIPS, None), (0, "spine_bb_", Some(0))]);
        assert!(matches!(result, Err(TemplateError::DuplicateId(0))));
    }
}
