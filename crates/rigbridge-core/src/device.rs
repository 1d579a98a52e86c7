//! Device service boundary
//!
//! The motion-capture driver is an external collaborator. Everything this
//! crate needs from it is expressed by [`DeviceService`]: template tree
//! queries, character model creation, per-node local matrices, bone group
//! registration, mapping buffer save/load and input hardware attachment.

use glam::Mat4;
use std::path::Path;
use thiserror::Error;

/// Index of a bone group registered with the device
pub type GroupIndex = usize;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device call {op} failed: {reason}")]
    CallFailed { op: &'static str, reason: String },
    #[error("Invalid {kind} index: {index}")]
    InvalidIndex { kind: &'static str, index: usize },
    #[error("No input device available")]
    NoInputDevice,
    #[error("Input device {0} is not ready")]
    InputUnavailable(InputHandle),
    #[error("Input device was removed")]
    DeviceRemoved,
    #[error("Invalid mapping buffer: {0}")]
    InvalidMapping(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Creates a generic call failure.
    pub fn call(op: &'static str, reason: impl Into<String>) -> Self {
        Self::CallFailed {
            op,
            reason: reason.into(),
        }
    }
}

/// Opaque handle of a physical input device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputHandle(pub u32);

impl std::fmt::Display for InputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "input-{}", self.0)
    }
}

/// State of the calibration button on the back of an input device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonState {
    #[default]
    Released,
    Pressed,
}

/// Operations offered by the motion-capture device service.
///
/// Character node indices are positions in the flat node list the character
/// was created from. Template indices are the device's own bone indices.
pub trait DeviceService: Send {
    /// Driver version string
    fn version(&self) -> Result<String, DeviceError>;

    // Character model

    /// Create a character model from a user topology.
    fn create_character(
        &mut self,
        parents: &[Option<usize>],
        names: &[String],
    ) -> Result<(), DeviceError>;

    /// Create the device's built-in standard character. Returns its parent list.
    fn create_standard_character(&mut self) -> Result<Vec<Option<usize>>, DeviceError>;

    fn character_name(&self, index: usize) -> Result<String, DeviceError>;

    fn local_matrix(&self, index: usize) -> Result<Mat4, DeviceError>;

    fn set_local_matrix(&mut self, index: usize, matrix: Mat4) -> Result<(), DeviceError>;

    /// Remember the current character pose as the initial (T) pose.
    fn memorize_initial_pose(&mut self) -> Result<(), DeviceError>;

    // Template tree

    fn template_root(&self) -> Result<usize, DeviceError>;

    fn template_name(&self, index: usize) -> Result<String, DeviceError>;

    fn template_children(&self, index: usize) -> Result<Vec<usize>, DeviceError>;

    /// Rest transform of a template bone. Drivers that do not expose it report identity.
    fn template_local_matrix(&self, _index: usize) -> Result<Mat4, DeviceError> {
        Ok(Mat4::IDENTITY)
    }

    // Bone groups

    /// Register the root group anchored at a character node and its parent.
    fn create_root_group(&mut self, parent: usize, node: usize) -> Result<GroupIndex, DeviceError>;

    fn add_group(
        &mut self,
        parent_group: GroupIndex,
        user_bones: &[usize],
        template_bones: &[usize],
    ) -> Result<GroupIndex, DeviceError>;

    /// Apply all accumulated groups to the retargeting engine.
    fn apply_groups(&mut self) -> Result<(), DeviceError>;

    // Mapping buffer

    /// Size in bytes of the serialized mapping buffer.
    fn mapping_len(&self) -> Result<usize, DeviceError>;

    /// Fill `buf` with the serialized mapping. Returns the number of bytes written.
    fn write_mapping(&self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    fn save_mapping_file(&self, path: &Path) -> Result<(), DeviceError>;

    fn load_mapping(&mut self, buf: &[u8]) -> Result<(), DeviceError>;

    // Input hardware

    fn input_count(&self) -> Result<usize, DeviceError>;

    fn input_handle(&self, slot: usize) -> Result<InputHandle, DeviceError>;

    /// `Ok(())` when the input device is connected and usable.
    fn input_ready(&self, handle: InputHandle) -> Result<(), DeviceError>;

    /// Input device currently attached to the character, if any.
    fn attached_input(&self) -> Option<InputHandle>;

    fn attach_input(&mut self, handle: InputHandle) -> Result<(), DeviceError>;

    fn button_state(&self, handle: InputHandle) -> Result<ButtonState, DeviceError>;

    fn calibrate(&mut self) -> Result<(), DeviceError>;

    /// Retarget the latest input pose onto the character's local matrices.
    fn copy_pose(&mut self) -> Result<(), DeviceError>;
}

impl<D: DeviceService + ?Sized> DeviceService for Box<D> {
    fn version(&self) -> Result<String, DeviceError> {
        (**self).version()
    }

    fn create_character(
        &mut self,
        parents: &[Option<usize>],
        names: &[String],
    ) -> Result<(), DeviceError> {
        (**self).create_character(parents, names)
    }

    fn create_standard_character(&mut self) -> Result<Vec<Option<usize>>, DeviceError> {
        (**self).create_standard_character()
    }

    fn character_name(&self, index: usize) -> Result<String, DeviceError> {
        (**self).character_name(index)
    }

    fn local_matrix(&self, index: usize) -> Result<Mat4, DeviceError> {
        (**self).local_matrix(index)
    }

    fn set_local_matrix(&mut self, index: usize, matrix: Mat4) -> Result<(), DeviceError> {
        (**self).set_local_matrix(index, matrix)
    }

    fn memorize_initial_pose(&mut self) -> Result<(), DeviceError> {
        (**self).memorize_initial_pose()
    }

    fn template_root(&self) -> Result<usize, DeviceError> {
        (**self).template_root()
    }

    fn template_name(&self, index: usize) -> Result<String, DeviceError> {
        (**self).template_name(index)
    }

    fn template_children(&self, index: usize) -> Result<Vec<usize>, DeviceError> {
        (**self).template_children(index)
    }

    fn template_local_matrix(&self, index: usize) -> Result<Mat4, DeviceError> {
        (**self).template_local_matrix(index)
    }

    fn create_root_group(&mut self, parent: usize, node: usize) -> Result<GroupIndex, DeviceError> {
        (**self).create_root_group(parent, node)
    }

    fn add_group(
        &mut self,
        parent_group: GroupIndex,
        user_bones: &[usize],
        template_bones: &[usize],
    ) -> Result<GroupIndex, DeviceError> {
        (**self).add_group(parent_group, user_bones, template_bones)
    }

    fn apply_groups(&mut self) -> Result<(), DeviceError> {
        (**self).apply_groups()
    }

    fn mapping_len(&self) -> Result<usize, DeviceError> {
        (**self).mapping_len()
    }

    fn write_mapping(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        (**self).write_mapping(buf)
    }

    fn save_mapping_file(&self, path: &Path) -> Result<(), DeviceError> {
        (**self).save_mapping_file(path)
    }

    fn load_mapping(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
        (**self).load_mapping(buf)
    }

    fn input_count(&self) -> Result<usize, DeviceError> {
        (**self).input_count()
    }

    fn input_handle(&self, slot: usize) -> Result<InputHandle, DeviceError> {
        (**self).input_handle(slot)
    }

    fn input_ready(&self, handle: InputHandle) -> Result<(), DeviceError> {
        (**self).input_ready(handle)
    }

    fn attached_input(&self) -> Option<InputHandle> {
        (**self).attached_input()
    }

    fn attach_input(&mut self, handle: InputHandle) -> Result<(), DeviceError> {
        (**self).attach_input(handle)
    }

    fn button_state(&self, handle: InputHandle) -> Result<ButtonState, DeviceError> {
        (**self).button_state(handle)
    }

    fn calibrate(&mut self) -> Result<(), DeviceError> {
        (**self).calibrate()
    }

    fn copy_pose(&mut self) -> Result<(), DeviceError> {
        (**self).copy_pose()
    }
}
