//! User skeleton: the arbitrary rig being driven by the device
//!
//! Nodes live in a flat list. A node's position in that list is its scene
//! index, which is also the character node index handed to the device.

use glam::Mat4;
use std::collections::HashMap;

/// A node of the user skeleton
#[derive(Debug, Clone)]
pub struct SceneNode {
    /// Identifier assigned by the rig's author (stable across imports)
    pub id: i64,
    pub name: String,
    /// Scene index of the parent
    pub parent: Option<usize>,
    /// Scene indices of the children, in import order
    pub children: Vec<usize>,
    pub local_transform: Mat4,
    /// Local transform as imported, before any scale offset or device pose
    pub initial_local_transform: Mat4,
    pub global_transform: Mat4,
}

impl SceneNode {
    pub fn new(id: i64, name: impl Into<String>, local_transform: Mat4) -> Self {
        Self {
            id,
            name: name.into(),
            parent: None,
            children: Vec::new(),
            local_transform,
            initial_local_transform: local_transform,
            global_transform: local_transform,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Flat node list with index-based parent/child links
#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    nodes: Vec<SceneNode>,
}

impl Skeleton {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Build a skeleton from nodes whose parents are given as node ids.
    ///
    /// A parent id that matches no node leaves the node as a root.
    pub fn from_parent_ids(entries: Vec<(SceneNode, Option<i64>)>) -> Self {
        let index_of: HashMap<i64, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, (node, _))| (node.id, i))
            .collect();

        let mut skeleton = Self::new();
        let mut links = Vec::with_capacity(entries.len());
        for (i, (node, parent_id)) in entries.into_iter().enumerate() {
            let parent = parent_id
                .and_then(|pid| index_of.get(&pid).copied())
                .filter(|&p| p != i);
            links.push(parent);
            skeleton.nodes.push(node);
        }
        for (child, parent) in links.into_iter().enumerate() {
            if let Some(parent) = parent {
                skeleton.link(parent, child);
            }
        }
        skeleton.update_global_transforms();
        skeleton
    }

    /// Build a skeleton from a parent index list (as reported by the device).
    pub fn from_parent_indices(nodes: Vec<SceneNode>, parents: &[Option<usize>]) -> Self {
        let mut skeleton = Self { nodes };
        for (child, parent) in parents.iter().enumerate() {
            if let Some(parent) = *parent {
                if parent < skeleton.nodes.len() && child < skeleton.nodes.len() && parent != child {
                    skeleton.link(parent, child);
                }
            }
        }
        skeleton.update_global_transforms();
        skeleton
    }

    /// Append a node, optionally under an existing parent. Returns its scene index.
    pub fn push(&mut self, node: SceneNode, parent: Option<usize>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(node);
        if let Some(parent) = parent.filter(|&p| p < index) {
            self.link(parent, index);
        }
        index
    }

    fn link(&mut self, parent: usize, child: usize) {
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[SceneNode] {
        &self.nodes
    }

    pub fn get(&self, index: usize) -> Option<&SceneNode> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SceneNode> {
        self.nodes.get_mut(index)
    }

    pub fn parent_of(&self, index: usize) -> Option<usize> {
        self.nodes.get(index).and_then(|n| n.parent)
    }

    /// Scene index of the first node with the given name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    pub fn is_child_of(&self, child: usize, parent: usize) -> bool {
        self.nodes
            .get(parent)
            .map(|p| p.children.contains(&child))
            .unwrap_or(false)
    }

    /// Parent index per node, in scene order
    pub fn parent_indices(&self) -> Vec<Option<usize>> {
        self.nodes.iter().map(|n| n.parent).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Reset every local transform to the imported one, post-multiplying roots by `root_scale`.
    pub fn reset_to_initial(&mut self, root_scale: Mat4) {
        for node in &mut self.nodes {
            node.local_transform = if node.is_root() {
                node.initial_local_transform * root_scale
            } else {
                node.initial_local_transform
            };
        }
        self.update_global_transforms();
    }

    /// Recompute every global transform from the current local transforms.
    ///
    /// Each global is the product of local transforms from the root down to
    /// the node. Must run after all locals of a frame have been written.
    pub fn update_global_transforms(&mut self) {
        for index in 0..self.nodes.len() {
            let global = self.compose_global(index);
            self.nodes[index].global_transform = global;
        }
    }

    fn compose_global(&self, index: usize) -> Mat4 {
        let mut global = Mat4::IDENTITY;
        let mut current = Some(index);
        // Guards against malformed parent cycles
        let mut steps = 0;
        while let Some(i) = current {
            if steps > self.nodes.len() {
                break;
            }
            let node = &self.nodes[i];
            global = node.local_transform * global;
            current = node.parent;
            steps += 1;
        }
        global
    }
}
