//! Group builder: turns the connection map into device bone groups
//!
//! A bone group pairs a contiguous run of user bones with a contiguous run
//! of template bones. User bones that are not hierarchically contiguous are
//! pruned; template segments are split or bundled according to [`rule_for`].

use std::collections::{BTreeSet, HashMap};
use tracing::warn;

use crate::connection::ConnectionMap;
use crate::device::GroupIndex;
use crate::skeleton::Skeleton;
use crate::template::{TemplateNode, TemplateTree};

/// Template bone id -> index of the group that already contains it
pub type KnownGroups = HashMap<usize, GroupIndex>;

/// One device group registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Scene indices, sorted ascending
    pub user_bones: Vec<usize>,
    /// Template bone ids, sorted ascending
    pub template_bones: Vec<usize>,
    pub parent_group: GroupIndex,
}

/// How a template bone's segment is formed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateRule {
    /// Bundle a fixed chain of named bones with this one
    Bundle(&'static [&'static str]),
    /// Proximal joint: starts a new chain under the parent's existing group
    Anchor,
    /// Add the first child and walk up to the nearest registered ancestor
    Chain,
}

const BUNDLES: &[(&str, &[&str])] = &[
    ("spine_bb_", &["spine1_bb_", "spine2_bb_", "neck_bb_"]),
    ("lefthandthumb1_bb_", &["lefthandthumb2_bb_", "lefthandthumb3_bb_", "lefthandthumb4_bb_"]),
    ("righthandthumb1_bb_", &["righthandthumb2_bb_", "righthandthumb3_bb_", "righthandthumb4_bb_"]),
    ("lefthandindex1_bb_", &["lefthandindex2_bb_", "lefthandindex3_bb_", "lefthandindex4_bb_"]),
    ("righthandindex1_bb_", &["righthandindex2_bb_", "righthandindex3_bb_", "righthandindex4_bb_"]),
    ("lefthandmiddle1_bb_", &["lefthandmiddle2_bb_", "lefthandmiddle3_bb_", "lefthandmiddle4_bb_"]),
    ("righthandmiddle1_bb_", &["righthandmiddle2_bb_", "righthandmiddle3_bb_", "righthandmiddle4_bb_"]),
    ("lefthandring1_bb_", &["lefthandring2_bb_", "lefthandring3_bb_", "lefthandring4_bb_"]),
    ("righthandring1_bb_", &["righthandring2_bb_", "righthandring3_bb_", "righthandring4_bb_"]),
    ("lefthandpinky1_bb_", &["lefthandpinky2_bb_", "lefthandpinky3_bb_", "lefthandpinky4_bb_"]),
    ("righthandpinky1_bb_", &["righthandpinky2_bb_", "righthandpinky3_bb_", "righthandpinky4_bb_"]),
];

const ANCHORS: &[&str] = &[
    "leftupleg_bb_",
    "rightupleg_bb_",
    "leftshoulder_bb_",
    "rightshoulder_bb_",
    "neck_bb_",
];

/// Segment rule for a template bone name
pub fn rule_for(name: &str) -> TemplateRule {
    if let Some((_, chain)) = BUNDLES.iter().find(|(bone, _)| *bone == name) {
        return TemplateRule::Bundle(chain);
    }
    if ANCHORS.contains(&name) {
        return TemplateRule::Anchor;
    }
    TemplateRule::Chain
}

/// Collect the user bones mapped to `template_name`, plus their parents.
///
/// The result is sorted by scene index and pruned so that every bone is a
/// direct child of the bone before it.
pub fn build_user_group(
    skeleton: &Skeleton,
    connections: &ConnectionMap,
    template_name: &str,
) -> Vec<usize> {
    let mut bones = BTreeSet::new();
    for node in connections.nodes_for(template_name) {
        if skeleton.get(node).is_none() {
            continue;
        }
        if let Some(parent) = skeleton.parent_of(node) {
            bones.insert(parent);
        }
        bones.insert(node);
    }

    let mut bones: Vec<usize> = bones.into_iter().collect();
    prune_discontiguous(skeleton, &mut bones);
    bones
}

/// Drop bones that are not a direct child of their predecessor.
///
/// Walks from the last entry down to index 1. After a removal the entry that
/// shifted into place is checked again against the same predecessor.
pub fn prune_discontiguous(skeleton: &Skeleton, bones: &mut Vec<usize>) {
    let mut k = bones.len();
    while k > 1 {
        k -= 1;
        if !skeleton.is_child_of(bones[k], bones[k - 1]) {
            bones.remove(k);
            if k < bones.len() {
                k += 1;
            }
        }
    }
}

/// Template side of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateGroup {
    /// Template bone ids, sorted ascending
    pub bones: Vec<usize>,
    pub parent_group: GroupIndex,
}

/// Compute the template bones and parent group for `node`.
///
/// `known` maps template ids to groups registered so far; `root_group` is
/// the parent used when no registered ancestor is found.
pub fn build_template_group(
    tree: &TemplateTree,
    node: &TemplateNode,
    known: &KnownGroups,
    root_group: GroupIndex,
) -> TemplateGroup {
    let mut bones = vec![node.id];
    let mut parent_group = root_group;

    match rule_for(&node.name) {
        TemplateRule::Bundle(chain) => {
            for name in chain {
                match tree.find(name) {
                    Some(bone) => bones.push(bone.id),
                    None => warn!(bone = %node.name, missing = %name, "Bundled template bone not found"),
                }
            }
        }
        TemplateRule::Anchor => {
            if let Some(&group) = node.parent.and_then(|p| known.get(&p)) {
                parent_group = group;
            }
            if let Some(child) = tree.first_child(node) {
                bones.push(child.id);
            }
        }
        TemplateRule::Chain => {
            if let Some(child) = tree.first_child(node) {
                bones.push(child.id);
            }
            let mut ancestor = tree.parent(node);
            while let Some(bone) = ancestor {
                if let Some(&group) = known.get(&bone.id) {
                    parent_group = group;
                    break;
                }
                bones.push(bone.id);
                ancestor = tree.parent(bone);
            }
        }
    }

    bones.sort_unstable();
    bones.dedup();
    TemplateGroup {
        bones,
        parent_group,
    }
}

/// Build the full group for template bone `node`.
///
/// Returns None when no user bone is mapped to it.
pub fn build_group(
    skeleton: &Skeleton,
    connections: &ConnectionMap,
    tree: &TemplateTree,
    node: &TemplateNode,
    known: &KnownGroups,
    root_group: GroupIndex,
) -> Option<Group> {
    let user_bones = build_user_group(skeleton, connections, &node.name);
    if user_bones.is_empty() {
        return None;
    }
    let template = build_template_group(tree, node, known, root_group);
    Some(Group {
        user_bones,
        template_bones: template.bones,
        parent_group: template.parent_group,
    })
}
