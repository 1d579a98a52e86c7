//! Retargeting context
//!
//! [`Retargeter`] owns the device handle together with everything derived
//! from it: the template tree, the user skeleton, the connection map and the
//! mapping state. The group connector, mapping persistence and the per-tick
//! pose propagation are all operations on it.

use glam::{Mat4, Vec3};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::ConnectionMap;
use crate::device::{ButtonState, DeviceError, DeviceService, InputHandle};
use crate::groups::{build_group, KnownGroups};
use crate::nnb::{bone_group_destinations, MappingBuffer, NnbError};
use crate::protocol::MappingHost;
use crate::skeleton::{SceneNode, Skeleton};
use crate::template::{TemplateError, TemplateTree, HIPS};
use crate::wire::{pose_frame, WireError, WireSkeleton};

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("No user rig is loaded")]
    NoUserRig,
    #[error("Connection map is empty")]
    EmptyConnections,
    #[error("No node is mapped to the hips bone")]
    MissingHips,
    #[error("Hips node '{0}' has no parent")]
    HipsWithoutParent(String),
    #[error("Mapping buffer is empty")]
    EmptyBuffer,
    #[error("Unknown node: {0}")]
    UnknownNode(String),
    #[error("Unknown template bone: {0}")]
    UnknownTemplateBone(String),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Document(#[from] NnbError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform scale post-multiplied onto root local transforms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleOffsets {
    /// Used when a user rig was imported
    pub user_rig: f32,
    /// Used for the device's built-in standard rig
    pub standard_rig: f32,
}

impl Default for ScaleOffsets {
    fn default() -> Self {
        Self {
            user_rig: 20.0,
            standard_rig: 0.2,
        }
    }
}

impl ScaleOffsets {
    pub fn matrix(&self, user_rig: bool) -> Mat4 {
        let factor = if user_rig {
            self.user_rig
        } else {
            self.standard_rig
        };
        Mat4::from_scale(Vec3::splat(factor))
    }
}

/// Session context driving one device
pub struct Retargeter<D: DeviceService> {
    device: D,
    template: TemplateTree,
    skeleton: Skeleton,
    connections: ConnectionMap,
    scale: ScaleOffsets,
    user_rig: bool,
    mapping_done: bool,
    rebuilding: bool,
    known_groups: KnownGroups,
}

impl<D: DeviceService> Retargeter<D> {
    pub fn new(device: D, scale: ScaleOffsets) -> Self {
        Self {
            device,
            template: TemplateTree::default(),
            skeleton: Skeleton::new(),
            connections: ConnectionMap::new(),
            scale,
            user_rig: false,
            mapping_done: false,
            rebuilding: false,
            known_groups: KnownGroups::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn template(&self) -> &TemplateTree {
        &self.template
    }

    pub fn skeleton(&self) -> &Skeleton {
        &self.skeleton
    }

    pub fn connections(&self) -> &ConnectionMap {
        &self.connections
    }

    pub fn scale(&self) -> ScaleOffsets {
        self.scale
    }

    pub fn has_user_rig(&self) -> bool {
        self.user_rig
    }

    pub fn mapping_done(&self) -> bool {
        self.mapping_done
    }

    /// Load the template tree and, if requested, the device's standard rig.
    pub fn start(&mut self, standard_rig: bool) -> Result<(), MappingError> {
        self.load_template()?;
        if standard_rig && !self.user_rig {
            self.rebuild(|this| this.load_standard_model())?;
            self.attach_or_warn();
        }
        Ok(())
    }

    pub fn load_template(&mut self) -> Result<(), MappingError> {
        self.template = TemplateTree::load(&self.device)?;
        info!(bones = self.template.len(), "Template tree loaded");
        Ok(())
    }

    /// Replace the user rig and rebuild the character model from it.
    ///
    /// The connection map and mapping state are reset. If the device rejects
    /// the new character the previous rig is rebuilt and kept.
    pub fn import_skeleton(&mut self, skeleton: Skeleton) -> Result<(), MappingError> {
        if skeleton.is_empty() {
            return Err(MappingError::NoUserRig);
        }
        let previous = std::mem::replace(&mut self.skeleton, skeleton);
        let previous_user_rig = std::mem::replace(&mut self.user_rig, true);
        self.reset();
        if let Err(e) = self.rebuild_model() {
            self.skeleton = previous;
            self.user_rig = previous_user_rig;
            if let Err(restore) = self.rebuild_model() {
                warn!(error = %restore, "Could not restore the previous character model");
                self.skeleton = Skeleton::new();
                self.user_rig = false;
            }
            return Err(e);
        }
        info!(nodes = self.skeleton.len(), "User rig imported");
        Ok(())
    }

    /// Import a rig sent as a skeleton wire frame.
    pub fn import_frame(&mut self, bytes: &[u8]) -> Result<(), MappingError> {
        let skeleton = WireSkeleton::from_bytes(bytes)?.to_skeleton()?;
        self.import_skeleton(skeleton)
    }

    /// Rebuild the character model from the current rig and reattach input.
    ///
    /// Input attach failures are logged and do not fail the rebuild.
    pub fn rebuild_model(&mut self) -> Result<(), MappingError> {
        if self.user_rig {
            self.rebuild(|this| this.load_character())?;
        } else if !self.skeleton.is_empty() {
            self.rebuild(|this| this.load_standard_model())?;
        } else {
            return Ok(());
        }
        if self.template.is_empty() {
            self.load_template()?;
        }
        self.attach_or_warn();
        Ok(())
    }

    fn rebuild(
        &mut self,
        build: impl FnOnce(&mut Self) -> Result<(), MappingError>,
    ) -> Result<(), MappingError> {
        self.rebuilding = true;
        let result = build(self);
        self.rebuilding = false;
        result
    }

    fn load_character(&mut self) -> Result<(), MappingError> {
        self.device
            .create_character(&self.skeleton.parent_indices(), &self.skeleton.names())?;
        for (index, node) in self.skeleton.nodes().iter().enumerate() {
            self.device
                .set_local_matrix(index, node.initial_local_transform)?;
        }
        self.device.memorize_initial_pose()?;
        self.skeleton.reset_to_initial(self.scale.matrix(true));
        debug!(nodes = self.skeleton.len(), "Character model created");
        Ok(())
    }

    fn load_standard_model(&mut self) -> Result<(), MappingError> {
        let parents = self.device.create_standard_character()?;
        let mut nodes = Vec::with_capacity(parents.len());
        for index in 0..parents.len() {
            let name = self.device.character_name(index)?;
            let local = self.device.local_matrix(index)?;
            nodes.push(SceneNode::new(index as i64, name, local));
        }
        self.skeleton = Skeleton::from_parent_indices(nodes, &parents);
        self.skeleton.reset_to_initial(self.scale.matrix(false));
        debug!(nodes = self.skeleton.len(), "Standard character created");
        Ok(())
    }

    fn attach_or_warn(&mut self) {
        if let Err(e) = self.attach() {
            warn!(error = %e, "Could not attach input device");
        }
    }

    /// Attach the first ready input, or cycle to the next ready one.
    pub fn attach(&mut self) -> Result<InputHandle, MappingError> {
        let count = self.device.input_count()?;
        if count == 0 {
            return Err(DeviceError::NoInputDevice.into());
        }

        let mut slots = Vec::with_capacity(count);
        for slot in 0..count {
            slots.push(self.device.input_handle(slot)?);
        }
        let start = self
            .device
            .attached_input()
            .and_then(|current| slots.iter().position(|&h| h == current))
            .map(|slot| slot + 1)
            .unwrap_or(0);

        let handle = (0..count)
            .map(|offset| slots[(start + offset) % count])
            .find(|&h| self.device.input_ready(h).is_ok())
            .ok_or(DeviceError::NoInputDevice)?;
        self.device.attach_input(handle)?;
        info!(input = %handle, "Input device attached");
        Ok(handle)
    }

    /// Attach the currently attached input again.
    pub fn reattach(&mut self) -> Result<InputHandle, MappingError> {
        let handle = self
            .device
            .attached_input()
            .ok_or(DeviceError::NoInputDevice)?;
        self.device.input_ready(handle)?;
        self.device.attach_input(handle)?;
        Ok(handle)
    }

    /// Map a node (by scene index) to a template bone.
    pub fn add_connection(&mut self, node: usize, template_name: &str) -> Result<(), MappingError> {
        if !self.user_rig {
            return Err(MappingError::NoUserRig);
        }
        if self.skeleton.get(node).is_none() {
            return Err(MappingError::UnknownNode(node.to_string()));
        }
        self.connections.insert(node, template_name);
        Ok(())
    }

    /// Map a node by name, fanning the mapping out to its siblings.
    ///
    /// Returns the number of nodes mapped.
    pub fn map_by_name(&mut self, node_name: &str, template_name: &str) -> Result<usize, MappingError> {
        if !self.user_rig {
            return Err(MappingError::NoUserRig);
        }
        let node = self
            .skeleton
            .index_of(node_name)
            .ok_or_else(|| MappingError::UnknownNode(node_name.to_string()))?;
        if self.template.find(template_name).is_none() {
            return Err(MappingError::UnknownTemplateBone(template_name.to_string()));
        }
        let mapped = self
            .connections
            .insert_with_siblings(&self.skeleton, node, template_name);
        debug!(node = node_name, template = template_name, mapped, "Connection added");
        Ok(mapped)
    }

    /// Forget the connection map and the mapping state.
    pub fn reset(&mut self) {
        self.connections.clear();
        self.mapping_done = false;
        self.known_groups.clear();
    }

    /// Register all bone groups with the device and apply them.
    pub fn connect(&mut self) -> Result<(), MappingError> {
        if self.connections.is_empty() {
            return Err(MappingError::EmptyConnections);
        }
        let hips = self
            .connections
            .nodes_for(HIPS)
            .next()
            .ok_or(MappingError::MissingHips)?;
        let hips_parent = self.skeleton.parent_of(hips).ok_or_else(|| {
            let name = self
                .skeleton
                .get(hips)
                .map(|n| n.name.clone())
                .unwrap_or_default();
            MappingError::HipsWithoutParent(name)
        })?;

        self.known_groups.clear();
        let root_group = self.device.create_root_group(hips_parent, hips)?;
        // Keyed by the parent's scene index, shares the template id key space
        self.known_groups.insert(hips_parent, root_group);

        let mut registered = 1;
        for node in self.template.nodes() {
            if node.name == HIPS {
                continue;
            }
            let Some(group) = build_group(
                &self.skeleton,
                &self.connections,
                &self.template,
                node,
                &self.known_groups,
                root_group,
            ) else {
                continue;
            };
            match self
                .device
                .add_group(group.parent_group, &group.user_bones, &group.template_bones)
            {
                Ok(index) => {
                    debug!(bone = %node.name, group = index, parent = group.parent_group, "Group registered");
                    for &id in &group.template_bones {
                        self.known_groups.insert(id, index);
                    }
                    registered += 1;
                }
                Err(e) => warn!(bone = %node.name, error = %e, "Group registration failed, skipping"),
            }
        }

        self.device.apply_groups()?;
        info!(groups = registered, "Bone groups applied");
        self.apply_mapping()
    }

    /// Re-establish the input attachment for the applied mapping.
    pub fn apply_mapping(&mut self) -> Result<(), MappingError> {
        if let Err(e) = self.reattach() {
            debug!(error = %e, "Reattach failed, attaching");
            self.attach()?;
        }
        self.mapping_done = true;
        Ok(())
    }

    /// Drop the mapping and rebuild the character model.
    pub fn disconnect(&mut self) -> Result<(), MappingError> {
        self.reset();
        self.rebuild_model()?;
        info!("Mapping disconnected");
        Ok(())
    }

    pub fn serialize(&self) -> Result<MappingBuffer, MappingError> {
        let len = self.device.mapping_len()?;
        if len == 0 {
            return Err(MappingError::EmptyBuffer);
        }
        let mut bytes = vec![0u8; len];
        let written = self.device.write_mapping(&mut bytes)?;
        bytes.truncate(written);
        Ok(MappingBuffer::new(bytes))
    }

    /// Load a mapping buffer into the device and rebuild the connection map.
    ///
    /// A node is recovered when its name occurs inside a group's destination
    /// names. Only group membership is recovered: every entry gets an empty
    /// template name. Returns the number of mapped nodes.
    pub fn deserialize(&mut self, buf: &[u8]) -> Result<usize, MappingError> {
        if buf.is_empty() {
            return Err(MappingError::EmptyBuffer);
        }
        self.device.load_mapping(buf)?;
        let destinations = bone_group_destinations(buf)?;

        let mut rebuilt = ConnectionMap::new();
        for destination in &destinations {
            for (index, node) in self.skeleton.nodes().iter().enumerate() {
                if node.name.is_empty() || !destination.contains(node.name.as_str()) {
                    continue;
                }
                rebuilt.insert(index, String::new());
            }
        }
        self.connections = rebuilt;
        debug!(groups = destinations.len(), nodes = self.connections.len(), "Mapping buffer loaded");
        Ok(self.connections.len())
    }

    /// Deserialize and apply a persisted mapping.
    ///
    /// On failure the connection map and mapping state are cleared.
    pub fn reconnect(&mut self, buf: &[u8]) -> Result<(), MappingError> {
        let result = self.deserialize(buf).and_then(|_| self.apply_mapping());
        if result.is_err() {
            self.reset();
        }
        result
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), MappingError> {
        self.device.save_mapping_file(path)?;
        info!(path = %path.display(), "Mapping saved");
        Ok(())
    }

    pub fn load_from_file(&mut self, path: &Path) -> Result<(), MappingError> {
        let bytes = std::fs::read(path)?;
        self.reconnect(&bytes)?;
        info!(path = %path.display(), "Mapping loaded");
        Ok(())
    }

    /// Run one pose tick. Returns true when the skeleton pose was updated.
    pub fn update(&mut self) -> Result<bool, MappingError> {
        if self.rebuilding || self.skeleton.is_empty() {
            return Ok(false);
        }
        let Some(input) = self.device.attached_input() else {
            return Ok(false);
        };

        match self.device.button_state(input) {
            Ok(ButtonState::Pressed) => {
                self.device.calibrate()?;
                info!(input = %input, "Calibrated");
                return Ok(false);
            }
            Ok(ButtonState::Released) => {}
            Err(DeviceError::DeviceRemoved) => return Err(DeviceError::DeviceRemoved.into()),
            Err(e) => debug!(input = %input, error = %e, "Button state unavailable"),
        }

        self.device.copy_pose()?;
        if self.mapping_done || !self.user_rig {
            self.propagate()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Read device local matrices into the skeleton and recompute globals.
    pub fn propagate(&mut self) -> Result<(), MappingError> {
        let scale = self.scale.matrix(self.user_rig);
        for index in 0..self.skeleton.len() {
            let local = self.device.local_matrix(index)?;
            if let Some(node) = self.skeleton.get_mut(index) {
                node.local_transform = if node.is_root() { local * scale } else { local };
            }
        }
        self.skeleton.update_global_transforms();
        Ok(())
    }

    /// Encoded pose frame of the mapped nodes
    pub fn pose_frame(&self) -> Result<Vec<u8>, MappingError> {
        Ok(pose_frame(&self.skeleton, &self.connections).to_bytes()?)
    }
}

impl<D: DeviceService> MappingHost for Retargeter<D> {
    fn pose_frame(&mut self) -> Vec<u8> {
        Retargeter::pose_frame(self).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to encode pose frame");
            Vec::new()
        })
    }

    fn import_skeleton(&mut self, payload: &[u8]) -> bool {
        match self.import_frame(payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Skeleton import failed");
                false
            }
        }
    }

    fn connect(&mut self) -> Option<MappingBuffer> {
        let result = Retargeter::connect(self)
            .and_then(|_| self.serialize())
            .and_then(|buffer| self.deserialize(buffer.as_bytes()).map(|_| buffer));
        match result {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                warn!(error = %e, "Connect failed");
                // Groups may already be applied
                if self.mapping_done {
                    MappingHost::disconnect(self);
                }
                None
            }
        }
    }

    fn disconnect(&mut self) {
        if let Err(e) = Retargeter::disconnect(self) {
            warn!(error = %e, "Model rebuild after disconnect failed");
        }
    }

    fn reconnect(&mut self, payload: &[u8]) -> bool {
        match Retargeter::reconnect(self, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Reconnect failed");
                false
            }
        }
    }

    fn map_bone(&mut self, node: &str, template: &str) -> bool {
        match self.map_by_name(node, template) {
            Ok(_) => true,
            Err(e) => {
                warn!(node, template, error = %e, "Mapping a bone failed");
                false
            }
        }
    }
}
