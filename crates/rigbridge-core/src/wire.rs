//! Skeleton wire frame
//!
//! CBOR encoded list of bones. The same layout carries pose frames sent to
//! the client (`get_pose`) and rig topologies imported from it
//! (`start_mapping` payloads).

use glam::Mat4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectionMap;
use crate::skeleton::{SceneNode, Skeleton};

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Failed to encode skeleton frame: {0}")]
    Encode(String),
    #[error("Failed to decode skeleton frame: {0}")]
    Decode(String),
    #[error("Skeleton frame has no bones")]
    Empty,
}

/// One bone of a wire frame. Matrices are column-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBone {
    pub id: i64,
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub name: String,
    pub global_transform: [f32; 16],
    /// Current local transform relative to the initial one when sent as a
    /// pose, the rest local transform when imported as a topology.
    pub local_transform: [f32; 16],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireSkeleton {
    pub bones: Vec<WireBone>,
}

impl WireSkeleton {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_cbor::to_vec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_cbor::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }

    /// Topology frame of a whole skeleton, carrying rest local transforms.
    pub fn from_skeleton(skeleton: &Skeleton) -> Self {
        let bones = skeleton
            .nodes()
            .iter()
            .map(|node| WireBone {
                id: node.id,
                parent_id: node.parent.and_then(|p| skeleton.get(p)).map(|p| p.id),
                name: node.name.clone(),
                global_transform: node.global_transform.to_cols_array(),
                local_transform: node.initial_local_transform.to_cols_array(),
            })
            .collect();
        Self { bones }
    }

    /// Build a skeleton from an imported topology frame.
    pub fn to_skeleton(&self) -> Result<Skeleton, WireError> {
        if self.bones.is_empty() {
            return Err(WireError::Empty);
        }
        let entries = self
            .bones
            .iter()
            .map(|bone| {
                let local = Mat4::from_cols_array(&bone.local_transform);
                (SceneNode::new(bone.id, bone.name.clone(), local), bone.parent_id)
            })
            .collect();
        Ok(Skeleton::from_parent_ids(entries))
    }
}

/// Strip the scale component, keeping rotation and translation.
pub fn remove_scale(matrix: Mat4) -> Mat4 {
    let (_, rotation, translation) = matrix.to_scale_rotation_translation();
    Mat4::from_rotation_translation(rotation, translation)
}

/// Pose frame of every mapped node.
///
/// Each bone carries its global transform and its local transform relative
/// to the imported one (`local * inverse(initial_local)`). Root bones are
/// sent without scale.
pub fn pose_frame(skeleton: &Skeleton, connections: &ConnectionMap) -> WireSkeleton {
    let bones = connections
        .iter()
        .filter_map(|(index, _)| skeleton.get(index))
        .map(|node| {
            let mut global = node.global_transform;
            let mut local_diff = node.local_transform * node.initial_local_transform.inverse();
            if node.is_root() {
                global = remove_scale(global);
                local_diff = remove_scale(local_diff);
            }
            WireBone {
                id: node.id,
                parent_id: node.parent.and_then(|p| skeleton.get(p)).map(|p| p.id),
                name: node.name.clone(),
                global_transform: global.to_cols_array(),
                local_transform: local_diff.to_cols_array(),
            }
        })
        .collect();
    WireSkeleton { bones }
}
