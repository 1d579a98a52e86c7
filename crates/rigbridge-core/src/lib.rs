//! Rigbridge Core - skeletal retargeting onto a device bone template
//!
//! This crate provides the mapping logic between an arbitrary character rig
//! and the fixed anatomical template of a motion-capture device:
//! - Template tree loading and the user skeleton arena
//! - Connection map and the bone group builder
//! - Group connector, mapping persistence (nnb documents) and pose propagation
//! - Session protocol state machine and the skeleton wire frame
//! - The [`DeviceService`] boundary implemented by device drivers

pub mod connection;
pub mod device;
pub mod groups;
pub mod nnb;
pub mod protocol;
pub mod retarget;
pub mod skeleton;
pub mod template;
pub mod wire;

pub use connection::ConnectionMap;
pub use device::{ButtonState, DeviceError, DeviceService, GroupIndex, InputHandle};
pub use groups::{build_group, build_template_group, build_user_group, prune_discontiguous, Group, TemplateGroup};
pub use nnb::{BoneGroupRecord, MappingBuffer, MappingDocument, NnbError};
pub use protocol::{Command, Inbound, MappingHost, Reply, Session, SessionState};
pub use retarget::{MappingError, Retargeter, ScaleOffsets};
pub use skeleton::{SceneNode, Skeleton};
pub use template::{TemplateError, TemplateNode, TemplateTree, HIPS};
pub use wire::{WireBone, WireError, WireSkeleton};
