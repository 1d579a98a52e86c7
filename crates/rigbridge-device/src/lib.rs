//! Rigbridge Device - in-process motion-capture device service
//!
//! This crate implements [`rigbridge_core::DeviceService`] without hardware:
//! the anatomical template, character models, bone group registration,
//! nnb mapping buffers and scriptable input devices.

pub mod simulated;
pub mod standard;

pub use simulated::{RegisteredGroup, SimulatedDevice, SimulatedInput};
pub use standard::{standard_character, template_bones, TemplateBone, STANDARD_ROOT};

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};
    use rigbridge_core::protocol::{self, Inbound, Reply, Session, SessionState};
    use rigbridge_core::{
        ButtonState, DeviceService, MappingError, Retargeter, ScaleOffsets, SceneNode, Skeleton,
        WireSkeleton, HIPS,
    };
    use tempfile::TempDir;

    /// Root -> Hips -> Spine -> Chest -> {Neck -> Head, LeftShoulder -> LeftArm -> LeftForeArm -> LeftHand}
    /// Hips -> LeftUpLeg -> LeftLeg -> LeftFoot
    fn rig() -> Skeleton {
        let bones: [(&str, Option<usize>, Vec3); 13] = [
            ("Root", None, Vec3::ZERO),
            ("Hips", Some(0), Vec3::new(0.0, 1.0, 0.0)),
            ("Spine", Some(1), Vec3::new(0.0, 0.1, 0.0)),
            ("Chest", Some(2), Vec3::new(0.0, 0.2, 0.0)),
            ("Neck", Some(3), Vec3::new(0.0, 0.2, 0.0)),
            ("Head", Some(4), Vec3::new(0.0, 0.1, 0.0)),
            ("LeftShoulder", Some(3), Vec3::new(0.1, 0.15, 0.0)),
            ("LeftArm", Some(6), Vec3::new(0.1, 0.0, 0.0)),
            ("LeftForeArm", Some(7), Vec3::new(0.25, 0.0, 0.0)),
            ("LeftHand", Some(8), Vec3::new(0.25, 0.0, 0.0)),
            ("LeftUpLeg", Some(1), Vec3::new(0.1, -0.05, 0.0)),
            ("LeftLeg", Some(10), Vec3::new(0.0, -0.45, 0.0)),
            ("LeftFoot", Some(11), Vec3::new(0.0, -0.45, 0.0)),
        ];
        let mut skeleton = Skeleton::new();
        for (i, (name, parent, offset)) in bones.into_iter().enumerate() {
            skeleton.push(SceneNode::new(i as i64 + 100, name, Mat4::from_translation(offset)), parent);
        }
        skeleton.update_global_transforms();
        skeleton
    }

    const MAPPING: [(&str, &str); 11] = [
        ("Hips", HIPS),
        ("Spine", "spine_bb_"),
        ("Neck", "neck_bb_"),
        ("Head", "head_bb_"),
        ("LeftShoulder", "leftshoulder_bb_"),
        ("LeftArm", "leftarm_bb_"),
        ("LeftForeArm", "leftforearm_bb_"),
        ("LeftHand", "lefthand_bb_"),
        ("LeftUpLeg", "leftupleg_bb_"),
        ("LeftLeg", "leftleg_bb_"),
        ("LeftFoot", "leftfoot_bb_"),
    ];

    fn retargeter(inputs: usize) -> Retargeter<SimulatedDevice> {
        let mut retargeter = Retargeter::new(SimulatedDevice::new(inputs), ScaleOffsets::default());
        retargeter.start(false).unwrap();
        retargeter.import_skeleton(rig()).unwrap();
        retargeter
    }

    fn mapped(inputs: usize) -> Retargeter<SimulatedDevice> {
        let mut retargeter = retargeter(inputs);
        for (node, bone) in MAPPING {
            let index = retargeter.skeleton().index_of(node).unwrap();
            retargeter.add_connection(index, bone).unwrap();
        }
        retargeter
    }

    #[test]
    fn test_template_load() {
        let mut retargeter = Retargeter::new(SimulatedDevice::default(), ScaleOffsets::default());
        retargeter.start(false).unwrap();
        let template = retargeter.template();
        assert_eq!(template.len(), 62);
        assert_eq!(template.root().unwrap().name, HIPS);
        for node in template.nodes().iter().skip(1) {
            assert!(template.parent(node).is_some(), "{} has no parent", node.name);
        }
        // Pre-order: every parent precedes its children
        let position = |id| template.nodes().iter().position(|n| n.id == id).unwrap();
        for node in template.nodes() {
            for &child in &node.children {
                assert!(position(node.id) < position(child));
            }
        }
    }

    #[test]
    fn test_add_connection_requires_user_rig() {
        let mut retargeter = Retargeter::new(SimulatedDevice::default(), ScaleOffsets::default());
        retargeter.start(true).unwrap();
        assert!(!retargeter.has_user_rig());
        assert!(matches!(retargeter.add_connection(1, HIPS), Err(MappingError::NoUserRig)));
        assert!(retargeter.connections().is_empty());
    }

    #[test]
    fn test_connect_with_empty_map_fails() {
        let mut retargeter = retargeter(1);
        assert!(matches!(retargeter.connect(), Err(MappingError::EmptyConnections)));
        assert!(retargeter.device().groups().is_empty());
        assert!(!retargeter.mapping_done());
    }

    #[test]
    fn test_connect_without_hips_fails() {
        let mut retargeter = retargeter(1);
        retargeter.add_connection(2, "spine_bb_").unwrap();
        retargeter.add_connection(4, "neck_bb_").unwrap();
        assert!(matches!(retargeter.connect(), Err(MappingError::MissingHips)));
        assert!(retargeter.device().groups().is_empty());
    }

    #[test]
    fn test_connect_hips_without_parent_fails() {
        let mut retargeter = retargeter(1);
        retargeter.add_connection(0, HIPS).unwrap();
        assert!(matches!(retargeter.connect(), Err(MappingError::HipsWithoutParent(_))));
        assert!(retargeter.device().groups().is_empty());
    }

    #[test]
    fn test_connect_registers_groups() {
        let mut retargeter = mapped(1);
        retargeter.connect().unwrap();
        assert!(retargeter.mapping_done());

        let device = retargeter.device();
        assert!(device.is_applied());
        assert!(device.attached_input().is_some());
        let groups = device.groups();
        assert_eq!(groups.len(), 11);
        assert_eq!(groups[0].user_bones, vec![0, 1]);
        assert_eq!(groups[0].parent, None);

        let spine = &groups[1];
        assert_eq!(spine.user_bones, vec![1, 2]);
        assert_eq!(spine.template_bones, vec![1, 2, 3, 4]);
        assert_eq!(spine.parent, Some(0));

        // Neck anchors on the spine group, the shoulder too
        let neck = &groups[2];
        assert_eq!(neck.user_bones, vec![3, 4]);
        assert_eq!(neck.parent, Some(1));
        let shoulder = &groups[4];
        assert_eq!(shoulder.user_bones, vec![3, 6]);
        assert_eq!(shoulder.parent, Some(1));
        // Arm chains onto the shoulder group
        assert_eq!(groups[5].parent, Some(4));
    }

    #[test]
    fn test_serialize_deserialize_round_trip() {
        let mut retargeter = mapped(1);
        retargeter.connect().unwrap();

        let first = retargeter.serialize().unwrap();
        retargeter.deserialize(first.as_bytes()).unwrap();
        let recovered = retargeter.connections().clone();
        assert!(recovered.contains(0));
        // Only group membership comes back
        for (node, _) in MAPPING {
            let index = retargeter.skeleton().index_of(node).unwrap();
            assert_eq!(recovered.lookup(index), Some(""), "{} not recovered", node);
        }
        assert!(recovered.iter().all(|(_, name)| name.is_empty()));

        let second = retargeter.serialize().unwrap();
        assert_eq!(first, second);
        retargeter.deserialize(second.as_bytes()).unwrap();
        assert_eq!(retargeter.connections(), &recovered);

        // Template names are gone, so the hips bone cannot be found again
        assert!(matches!(retargeter.connect(), Err(MappingError::MissingHips)));
        assert_eq!(retargeter.serialize().unwrap(), first);
    }

    #[test]
    fn test_deserialize_empty_buffer_fails() {
        let mut retargeter = retargeter(1);
        assert!(matches!(retargeter.deserialize(&[]), Err(MappingError::EmptyBuffer)));
    }

    #[test]
    fn test_mapping_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mapping.nnb");

        let mut source = mapped(1);
        source.connect().unwrap();
        source.save_to_file(&path).unwrap();
        let in_memory = source.serialize().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), in_memory.as_bytes());

        let mut target = retargeter(1);
        target.load_from_file(&path).unwrap();
        assert!(target.mapping_done());
        assert_eq!(target.device().groups(), source.device().groups());
        assert_eq!(target.serialize().unwrap(), in_memory);
    }

    #[test]
    fn test_reconnect_failure_clears_mapping() {
        let mut retargeter = mapped(1);
        retargeter.connect().unwrap();
        assert!(retargeter.reconnect(b"<nnb version=\"1.0\"/>").is_err());
        assert!(retargeter.connections().is_empty());
        assert!(!retargeter.mapping_done());
    }

    #[test]
    fn test_disconnect_rebuilds_model() {
        let mut retargeter = mapped(1);
        retargeter.connect().unwrap();
        retargeter.disconnect().unwrap();

        assert!(retargeter.connections().is_empty());
        assert!(!retargeter.mapping_done());
        assert!(retargeter.device().groups().is_empty());
        let scale = retargeter.scale().matrix(true);
        let root = retargeter.skeleton().get(0).unwrap();
        assert!(root.local_transform.abs_diff_eq(root.initial_local_transform * scale, 1e-6));
    }

    #[test]
    fn test_attach_cycles_ready_inputs() {
        let mut retargeter = retargeter(2);
        let first = retargeter.device().input_handle(0).unwrap();
        let second = retargeter.device().input_handle(1).unwrap();
        assert_eq!(retargeter.device().attached_input(), Some(first));

        assert_eq!(retargeter.attach().unwrap(), second);
        assert_eq!(retargeter.attach().unwrap(), first);

        retargeter.device_mut().input_mut(1).unwrap().ready = false;
        assert_eq!(retargeter.attach().unwrap(), first);
        assert_eq!(retargeter.reattach().unwrap(), first);

        let mut none = Retargeter::new(SimulatedDevice::new(0), ScaleOffsets::default());
        none.import_skeleton(rig()).unwrap();
        assert!(none.attach().is_err());
    }

    #[test]
    fn test_update_propagates_after_mapping() {
        let mut retargeter = mapped(1);
        // Not mapped yet: the user rig does not follow the device
        assert!(!retargeter.update().unwrap());

        retargeter.connect().unwrap();
        let delta = Mat4::from_rotation_y(0.6);
        retargeter.device_mut().set_input_pose(0, HIPS, delta).unwrap();
        assert!(retargeter.update().unwrap());

        let skeleton = retargeter.skeleton();
        let root = skeleton.get(0).unwrap();
        let hips = skeleton.get(1).unwrap();
        let scale = retargeter.scale().matrix(true);
        assert!(root.local_transform.abs_diff_eq(root.initial_local_transform * scale, 1e-5));
        assert!(hips.local_transform.abs_diff_eq(hips.initial_local_transform * delta, 1e-5));
        assert!(hips
            .global_transform
            .abs_diff_eq(root.local_transform * hips.local_transform, 1e-5));

        let head = skeleton.get(5).unwrap();
        let chain = (0..=5).fold(Mat4::IDENTITY, |acc, i| acc * skeleton.get(i).unwrap().local_transform);
        assert!(head.global_transform.abs_diff_eq(chain, 1e-4));
    }

    #[test]
    fn test_update_calibrates_and_detects_removal() {
        let mut retargeter = mapped(1);
        retargeter.connect().unwrap();

        retargeter.device_mut().input_mut(0).unwrap().button = ButtonState::Pressed;
        assert!(!retargeter.update().unwrap());
        assert_eq!(retargeter.device().calibrations(), 1);
        assert!(retargeter.update().unwrap());

        retargeter.device_mut().input_mut(0).unwrap().removed = true;
        assert!(retargeter.update().is_err());
    }

    #[test]
    fn test_standard_rig_follows_device() {
        let mut retargeter = Retargeter::new(SimulatedDevice::default(), ScaleOffsets::default());
        retargeter.start(true).unwrap();
        assert_eq!(retargeter.skeleton().len(), 63);
        assert_eq!(retargeter.skeleton().get(0).unwrap().name, STANDARD_ROOT);

        assert!(retargeter.update().unwrap());
        let root = retargeter.skeleton().get(0).unwrap();
        let scale = retargeter.scale().matrix(false);
        assert!(root.local_transform.abs_diff_eq(scale, 1e-6));
    }

    #[test]
    fn test_session_drives_retargeter() {
        let mut retargeter = Retargeter::new(SimulatedDevice::default(), ScaleOffsets::default());
        retargeter.start(false).unwrap();
        let mut session = Session::new();
        let topology = WireSkeleton::from_skeleton(&rig()).to_bytes().unwrap();

        // Payload without start_mapping is ignored
        assert_eq!(session.handle(&mut retargeter, Inbound::Binary(&topology)), None);
        assert!(!retargeter.has_user_rig());

        assert_eq!(
            session.handle(&mut retargeter, Inbound::Text("start_mapping")),
            Some(Reply::Status(protocol::START_MAPPING_DONE))
        );
        assert_eq!(
            session.handle(&mut retargeter, Inbound::Binary(&topology)),
            Some(Reply::Status(protocol::IMPORT_BONE_DONE))
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(retargeter.skeleton().len(), 13);

        assert_eq!(
            session.handle(&mut retargeter, Inbound::Text("connect")),
            Some(Reply::Status(protocol::CONNECT_FAILED))
        );
        for command in ["map:Hips:hips_bb_", "map:Head:head_bb_"] {
            assert_eq!(
                session.handle(&mut retargeter, Inbound::Text(command)),
                Some(Reply::Status(protocol::MAP_DONE))
            );
        }
        assert_eq!(
            session.handle(&mut retargeter, Inbound::Text("map:Tail:hips_bb_")),
            Some(Reply::Status(protocol::MAP_FAILED))
        );

        let buffer = match session.handle(&mut retargeter, Inbound::Text("connect")) {
            Some(Reply::Mapping(buffer)) => buffer,
            other => panic!("unexpected reply {:?}", other),
        };
        assert_eq!(session.state(), SessionState::Connected);
        assert!(buffer.as_str().unwrap().contains("Head"));

        match session.handle(&mut retargeter, Inbound::Text("get_pose")) {
            Some(Reply::Pose(bytes)) => {
                let frame = WireSkeleton::from_bytes(&bytes).unwrap();
                assert!(frame.bones.iter().any(|b| b.name == "Head"));
            }
            other => panic!("unexpected reply {:?}", other),
        }

        assert_eq!(
            session.handle(&mut retargeter, Inbound::Text("disconnect")),
            Some(Reply::Status(protocol::DISCONNECT_DONE))
        );
        assert!(!retargeter.mapping_done());

        session.handle(&mut retargeter, Inbound::Text("start_reconnect"));
        let text = buffer.as_str().unwrap();
        assert_eq!(
            session.handle(&mut retargeter, Inbound::Text(text)),
            Some(Reply::Status(protocol::IMPORT_MAPPING_DATA_DONE))
        );
        assert_eq!(session.state(), SessionState::Connected);
        assert!(retargeter.mapping_done());
    }
}
