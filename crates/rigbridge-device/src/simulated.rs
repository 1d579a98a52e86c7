//! In-process device service
//!
//! [`SimulatedDevice`] keeps the whole device state in memory: the template,
//! one character model, the registered bone groups and a set of input
//! devices whose poses can be scripted.

use glam::Mat4;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use rigbridge_core::nnb::{join_list, BoneGroupRecord, MappingDocument};
use rigbridge_core::{ButtonState, DeviceError, DeviceService, GroupIndex, InputHandle, HIPS};

use crate::standard::{standard_character, template_bones, TemplateBone};

/// A scriptable input device
#[derive(Debug, Clone)]
pub struct SimulatedInput {
    pub handle: InputHandle,
    pub ready: bool,
    pub removed: bool,
    pub button: ButtonState,
    /// Local rotation deltas keyed by template bone index
    pub pose: HashMap<usize, Mat4>,
}

impl SimulatedInput {
    fn new(handle: InputHandle) -> Self {
        Self {
            handle,
            ready: true,
            removed: false,
            button: ButtonState::Released,
            pose: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Character {
    names: Vec<String>,
    locals: Vec<Mat4>,
    initial: Vec<Mat4>,
    standard: bool,
}

/// A registered bone group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredGroup {
    pub parent: Option<GroupIndex>,
    pub user_bones: Vec<usize>,
    pub template_bones: Vec<usize>,
}

/// Device service running entirely in memory
pub struct SimulatedDevice {
    template: Vec<TemplateBone>,
    character: Option<Character>,
    groups: Vec<RegisteredGroup>,
    applied: bool,
    inputs: Vec<SimulatedInput>,
    attached: Option<InputHandle>,
    calibrations: usize,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimulatedDevice {
    /// Create a device with `inputs` connected input devices.
    pub fn new(inputs: usize) -> Self {
        let inputs = (0..inputs)
            .map(|i| SimulatedInput::new(InputHandle(i as u32 + 1)))
            .collect();
        Self {
            template: template_bones(),
            character: None,
            groups: Vec::new(),
            applied: false,
            inputs,
            attached: None,
            calibrations: 0,
        }
    }

    pub fn groups(&self) -> &[RegisteredGroup] {
        &self.groups
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn calibrations(&self) -> usize {
        self.calibrations
    }

    pub fn input_mut(&mut self, slot: usize) -> Option<&mut SimulatedInput> {
        self.inputs.get_mut(slot)
    }

    /// Script the pose of template bone `bone` on the input in `slot`.
    pub fn set_input_pose(&mut self, slot: usize, bone: &str, delta: Mat4) -> Result<(), DeviceError> {
        let index = self
            .template_index(bone)
            .ok_or_else(|| DeviceError::call("set_input_pose", format!("unknown bone {}", bone)))?;
        let input = self.inputs.get_mut(slot).ok_or(DeviceError::InvalidIndex {
            kind: "input slot",
            index: slot,
        })?;
        input.pose.insert(index, delta);
        Ok(())
    }

    fn template_index(&self, name: &str) -> Option<usize> {
        self.template.iter().position(|b| b.name == name)
    }

    fn character(&self, op: &'static str) -> Result<&Character, DeviceError> {
        self.character
            .as_ref()
            .ok_or_else(|| DeviceError::call(op, "no character model"))
    }

    fn character_mut(&mut self, op: &'static str) -> Result<&mut Character, DeviceError> {
        self.character
            .as_mut()
            .ok_or_else(|| DeviceError::call(op, "no character model"))
    }

    fn input(&self, handle: InputHandle) -> Result<&SimulatedInput, DeviceError> {
        self.inputs
            .iter()
            .find(|i| i.handle == handle)
            .ok_or(DeviceError::InputUnavailable(handle))
    }

    fn install_character(&mut self, character: Character) {
        self.character = Some(character);
        self.groups.clear();
        self.applied = false;
    }

    fn check_node(&self, op: &'static str, index: usize) -> Result<(), DeviceError> {
        if index < self.character(op)?.names.len() {
            Ok(())
        } else {
            Err(DeviceError::InvalidIndex { kind: "node", index })
        }
    }

    fn document(&self) -> Result<MappingDocument, DeviceError> {
        let character = self.character("write_mapping")?;
        let mut doc = MappingDocument::new();
        for (index, group) in self.groups.iter().enumerate() {
            let template_names: Vec<&str> = group
                .template_bones
                .iter()
                .map(|&t| self.template[t].name.as_str())
                .collect();
            let user_names: Vec<&str> = group
                .user_bones
                .iter()
                .map(|&u| character.names[u].as_str())
                .collect();
            doc.groups.push(BoneGroupRecord {
                index,
                parent: group.parent,
                source_name_group: join_list(&template_names),
                source_index_group: join_list(&group.template_bones),
                destination_name_group: join_list(&user_names),
                destination_index_group: join_list(&group.user_bones),
            });
        }
        Ok(doc)
    }

    fn encode(&self) -> Result<String, DeviceError> {
        if self.groups.is_empty() {
            return Err(DeviceError::call("write_mapping", "no bone groups registered"));
        }
        self.document()?
            .to_xml()
            .map_err(|e| DeviceError::InvalidMapping(e.to_string()))
    }

    fn resolve_record(
        &self,
        character: &Character,
        record: &BoneGroupRecord,
    ) -> Result<RegisteredGroup, DeviceError> {
        let invalid = |reason: String| DeviceError::InvalidMapping(format!("group {}: {}", record.index, reason));

        let template_bones = record
            .template_indices()
            .map_err(|e| invalid(e.to_string()))?;
        let template_names = record.template_names();
        if template_bones.is_empty() || template_bones.len() != template_names.len() {
            return Err(invalid("template bone lists do not match".into()));
        }
        for (&index, name) in template_bones.iter().zip(&template_names) {
            if self.template.get(index).map(|b| b.name.as_str()) != Some(*name) {
                return Err(invalid(format!("template bone {} is not {}", index, name)));
            }
        }

        let user_bones = record
            .user_names()
            .into_iter()
            .map(|name| {
                character
                    .names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| invalid(format!("unknown node {}", name)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if user_bones.is_empty() {
            return Err(invalid("no user bones".into()));
        }

        Ok(RegisteredGroup {
            parent: record.parent,
            user_bones,
            template_bones,
        })
    }
}

impl DeviceService for SimulatedDevice {
    fn version(&self) -> Result<String, DeviceError> {
        Ok(format!("rigbridge-sim {}", env!("CARGO_PKG_VERSION")))
    }

    fn create_character(
        &mut self,
        parents: &[Option<usize>],
        names: &[String],
    ) -> Result<(), DeviceError> {
        if names.is_empty() || parents.len() != names.len() {
            return Err(DeviceError::call(
                "create_character",
                format!("{} parents for {} names", parents.len(), names.len()),
            ));
        }
        if let Some(&index) = parents.iter().flatten().find(|&&p| p >= names.len()) {
            return Err(DeviceError::InvalidIndex { kind: "parent", index });
        }
        self.install_character(Character {
            names: names.to_vec(),
            locals: vec![Mat4::IDENTITY; names.len()],
            initial: vec![Mat4::IDENTITY; names.len()],
            standard: false,
        });
        debug!(nodes = names.len(), "Character created");
        Ok(())
    }

    fn create_standard_character(&mut self) -> Result<Vec<Option<usize>>, DeviceError> {
        let (names, parents, locals) = standard_character(&self.template);
        self.install_character(Character {
            names,
            initial: locals.clone(),
            locals,
            standard: true,
        });
        Ok(parents)
    }

    fn character_name(&self, index: usize) -> Result<String, DeviceError> {
        self.character("character_name")?
            .names
            .get(index)
            .cloned()
            .ok_or(DeviceError::InvalidIndex { kind: "node", index })
    }

    fn local_matrix(&self, index: usize) -> Result<Mat4, DeviceError> {
        self.character("local_matrix")?
            .locals
            .get(index)
            .copied()
            .ok_or(DeviceError::InvalidIndex { kind: "node", index })
    }

    fn set_local_matrix(&mut self, index: usize, matrix: Mat4) -> Result<(), DeviceError> {
        let local = self
            .character_mut("set_local_matrix")?
            .locals
            .get_mut(index)
            .ok_or(DeviceError::InvalidIndex { kind: "node", index })?;
        *local = matrix;
        Ok(())
    }

    fn memorize_initial_pose(&mut self) -> Result<(), DeviceError> {
        let character = self.character_mut("memorize_initial_pose")?;
        character.initial = character.locals.clone();
        Ok(())
    }

    fn template_root(&self) -> Result<usize, DeviceError> {
        self.template_index(HIPS)
            .ok_or_else(|| DeviceError::call("template_root", "template is empty"))
    }

    fn template_name(&self, index: usize) -> Result<String, DeviceError> {
        self.template
            .get(index)
            .map(|b| b.name.clone())
            .ok_or(DeviceError::InvalidIndex { kind: "template", index })
    }

    fn template_children(&self, index: usize) -> Result<Vec<usize>, DeviceError> {
        self.template
            .get(index)
            .map(|b| b.children.clone())
            .ok_or(DeviceError::InvalidIndex { kind: "template", index })
    }

    fn template_local_matrix(&self, index: usize) -> Result<Mat4, DeviceError> {
        self.template
            .get(index)
            .map(|b| b.rest)
            .ok_or(DeviceError::InvalidIndex { kind: "template", index })
    }

    fn create_root_group(&mut self, parent: usize, node: usize) -> Result<GroupIndex, DeviceError> {
        self.check_node("create_root_group", parent)?;
        self.check_node("create_root_group", node)?;
        if parent == node {
            return Err(DeviceError::call("create_root_group", "anchor nodes must differ"));
        }
        let hips = self.template_root()?;
        self.groups.clear();
        self.applied = false;
        self.groups.push(RegisteredGroup {
            parent: None,
            user_bones: vec![parent, node],
            template_bones: vec![hips],
        });
        Ok(0)
    }

    fn add_group(
        &mut self,
        parent_group: GroupIndex,
        user_bones: &[usize],
        template_bones: &[usize],
    ) -> Result<GroupIndex, DeviceError> {
        if parent_group >= self.groups.len() {
            return Err(DeviceError::InvalidIndex {
                kind: "group",
                index: parent_group,
            });
        }
        if user_bones.is_empty() || template_bones.is_empty() {
            return Err(DeviceError::call("add_group", "bone list is empty"));
        }
        for &node in user_bones {
            self.check_node("add_group", node)?;
        }
        if let Some(&index) = template_bones.iter().find(|&&t| t >= self.template.len()) {
            return Err(DeviceError::InvalidIndex { kind: "template", index });
        }
        self.groups.push(RegisteredGroup {
            parent: Some(parent_group),
            user_bones: user_bones.to_vec(),
            template_bones: template_bones.to_vec(),
        });
        Ok(self.groups.len() - 1)
    }

    fn apply_groups(&mut self) -> Result<(), DeviceError> {
        if self.groups.is_empty() {
            return Err(DeviceError::call("apply_groups", "no root group"));
        }
        self.applied = true;
        info!(groups = self.groups.len(), "Groups applied");
        Ok(())
    }

    fn mapping_len(&self) -> Result<usize, DeviceError> {
        Ok(self.encode()?.len())
    }

    fn write_mapping(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let xml = self.encode()?;
        if buf.len() < xml.len() {
            return Err(DeviceError::call(
                "write_mapping",
                format!("buffer of {} bytes is too small for {}", buf.len(), xml.len()),
            ));
        }
        buf[..xml.len()].copy_from_slice(xml.as_bytes());
        Ok(xml.len())
    }

    fn save_mapping_file(&self, path: &Path) -> Result<(), DeviceError> {
        let xml = self.encode()?;
        std::fs::write(path, xml)?;
        Ok(())
    }

    fn load_mapping(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
        let doc = MappingDocument::from_bytes(buf)
            .map_err(|e| DeviceError::InvalidMapping(e.to_string()))?;
        let character = self.character("load_mapping")?;
        if doc.groups.is_empty() {
            return Err(DeviceError::InvalidMapping("no bone groups".into()));
        }

        let mut groups = Vec::with_capacity(doc.groups.len());
        for (position, record) in doc.groups.iter().enumerate() {
            if record.index != position || record.parent.is_some_and(|p| p >= position) {
                return Err(DeviceError::InvalidMapping(format!(
                    "group {} is out of order",
                    record.index
                )));
            }
            groups.push(self.resolve_record(character, record)?);
        }

        self.groups = groups;
        self.applied = true;
        debug!(groups = self.groups.len(), "Mapping loaded");
        Ok(())
    }

    fn input_count(&self) -> Result<usize, DeviceError> {
        Ok(self.inputs.len())
    }

    fn input_handle(&self, slot: usize) -> Result<InputHandle, DeviceError> {
        self.inputs
            .get(slot)
            .map(|i| i.handle)
            .ok_or(DeviceError::InvalidIndex {
                kind: "input slot",
                index: slot,
            })
    }

    fn input_ready(&self, handle: InputHandle) -> Result<(), DeviceError> {
        let input = self.input(handle)?;
        if input.ready && !input.removed {
            Ok(())
        } else {
            Err(DeviceError::InputUnavailable(handle))
        }
    }

    fn attached_input(&self) -> Option<InputHandle> {
        self.attached
    }

    fn attach_input(&mut self, handle: InputHandle) -> Result<(), DeviceError> {
        self.input_ready(handle)?;
        self.character("attach_input")?;
        self.attached = Some(handle);
        Ok(())
    }

    fn button_state(&self, handle: InputHandle) -> Result<ButtonState, DeviceError> {
        let input = self.input(handle)?;
        if input.removed {
            return Err(DeviceError::DeviceRemoved);
        }
        Ok(input.button)
    }

    fn calibrate(&mut self) -> Result<(), DeviceError> {
        let handle = self.attached.ok_or(DeviceError::NoInputDevice)?;
        if let Some(input) = self.inputs.iter_mut().find(|i| i.handle == handle) {
            input.button = ButtonState::Released;
        }
        self.calibrations += 1;
        Ok(())
    }

    fn copy_pose(&mut self) -> Result<(), DeviceError> {
        let handle = self.attached.ok_or(DeviceError::NoInputDevice)?;
        let input = self.input(handle)?;
        if input.removed {
            return Err(DeviceError::DeviceRemoved);
        }
        let pose = input.pose.clone();
        let pairs: Vec<(usize, usize)> = if self.applied {
            // The first user bone anchors a group to its parent and is not driven
            self.groups
                .iter()
                .flat_map(|g| {
                    let driven = if g.user_bones.len() > 1 {
                        &g.user_bones[1..]
                    } else {
                        &g.user_bones[..]
                    };
                    driven
                        .iter()
                        .zip(&g.template_bones)
                        .map(|(&u, &t)| (u, t))
                        .collect::<Vec<_>>()
                })
                .collect()
        } else if self.character("copy_pose")?.standard {
            (0..self.template.len()).map(|t| (t + 1, t)).collect()
        } else {
            Vec::new()
        };

        let character = self.character_mut("copy_pose")?;
        for (node, bone) in pairs {
            if let (Some(local), Some(initial)) = (character.locals.get_mut(node), character.initial.get(node)) {
                *local = *initial * pose.get(&bone).copied().unwrap_or(Mat4::IDENTITY);
            }
        }
        Ok(())
    }
}
