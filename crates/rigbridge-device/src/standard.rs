//! Built-in template tree and standard character
//!
//! The template follows the device's anatomical naming: every bone name
//! ends with `_bb_`, hands carry four segments per finger.

use glam::{Mat4, Vec3};

/// A bone of the device template
#[derive(Debug, Clone)]
pub struct TemplateBone {
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub rest: Mat4,
}

const FINGERS: [&str; 5] = ["thumb", "index", "middle", "ring", "pinky"];

/// Name of the extra root node above the hips in the standard character
pub const STANDARD_ROOT: &str = "Reference";

struct Builder {
    bones: Vec<TemplateBone>,
}

impl Builder {
    fn push(&mut self, name: String, parent: Option<usize>, offset: Vec3) -> usize {
        let index = self.bones.len();
        if let Some(parent) = parent {
            self.bones[parent].children.push(index);
        }
        self.bones.push(TemplateBone {
            name,
            parent,
            children: Vec::new(),
            rest: Mat4::from_translation(offset),
        });
        index
    }

    fn chain(&mut self, names: &[String], parent: usize, offset: Vec3) -> usize {
        let mut last = parent;
        for name in names {
            last = self.push(name.clone(), Some(last), offset);
        }
        last
    }

    fn arm(&mut self, side: &str, spine: usize, dir: f32) {
        let names: Vec<String> = ["shoulder", "arm", "forearm", "hand"]
            .iter()
            .map(|part| format!("{side}{part}_bb_"))
            .collect();
        let hand = self.chain(&names, spine, Vec3::new(dir * 0.15, 0.0, 0.0));
        for (i, finger) in FINGERS.iter().enumerate() {
            let spread = (i as f32 - 2.0) * 0.02;
            let first = self.push(
                format!("{side}hand{finger}1_bb_"),
                Some(hand),
                Vec3::new(dir * 0.08, 0.0, spread),
            );
            let rest: Vec<String> = (2..=4)
                .map(|segment| format!("{side}hand{finger}{segment}_bb_"))
                .collect();
            self.chain(&rest, first, Vec3::new(dir * 0.03, 0.0, 0.0));
        }
    }

    fn leg(&mut self, side: &str, hips: usize, dir: f32) {
        let upleg = self.push(
            format!("{side}upleg_bb_"),
            Some(hips),
            Vec3::new(dir * 0.1, -0.05, 0.0),
        );
        let names: Vec<String> = ["leg", "foot", "toebase"]
            .iter()
            .map(|part| format!("{side}{part}_bb_"))
            .collect();
        self.chain(&names, upleg, Vec3::new(0.0, -0.4, 0.0));
    }
}

/// The device template in pre-order, indexed by device bone index
pub fn template_bones() -> Vec<TemplateBone> {
    let mut builder = Builder { bones: Vec::new() };
    let hips = builder.push("hips_bb_".into(), None, Vec3::new(0.0, 1.0, 0.0));
    let spine_names: Vec<String> = ["spine_bb_", "spine1_bb_", "spine2_bb_"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let spine2 = builder.chain(&spine_names, hips, Vec3::new(0.0, 0.12, 0.0));
    let neck = builder.push("neck_bb_".into(), Some(spine2), Vec3::new(0.0, 0.15, 0.0));
    builder.push("head_bb_".into(), Some(neck), Vec3::new(0.0, 0.1, 0.0));
    builder.arm("left", spine2, 1.0);
    builder.arm("right", spine2, -1.0);
    builder.leg("left", hips, 1.0);
    builder.leg("right", hips, -1.0);
    builder.bones
}

/// Node name of template bone `name` in the standard character
pub fn standard_name(template_name: &str) -> String {
    let base = template_name.trim_end_matches("_bb_");
    let mut chars = base.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Standard character: a reference root followed by one node per template bone.
///
/// Returns `(names, parents, rest locals)`; node `i + 1` mirrors template bone `i`.
pub fn standard_character(template: &[TemplateBone]) -> (Vec<String>, Vec<Option<usize>>, Vec<Mat4>) {
    let mut names = vec![STANDARD_ROOT.to_string()];
    let mut parents = vec![None];
    let mut locals = vec![Mat4::IDENTITY];
    for bone in template {
        names.push(standard_name(&bone.name));
        parents.push(Some(bone.parent.map_or(0, |p| p + 1)));
        locals.push(bone.rest);
    }
    (names, parents, locals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_template_layout() {
        let bones = template_bones();
        // 6 trunk + 2 * (4 arm + 20 finger) + 2 * 4 leg
        assert_eq!(bones.len(), 62);
        assert_eq!(bones[0].name, "hips_bb_");
        assert!(bones[0].parent.is_none());

        let names: HashSet<_> = bones.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names.len(), bones.len());
        for name in ["neck_bb_", "lefthandpinky4_bb_", "righttoebase_bb_", "rightshoulder_bb_"] {
            assert!(names.contains(name), "missing {}", name);
        }

        // Parents precede their children
        for (i, bone) in bones.iter().enumerate() {
            if let Some(parent) = bone.parent {
                assert!(parent < i);
                assert!(bones[parent].children.contains(&i));
            }
        }
    }

    #[test]
    fn test_standard_character() {
        let bones = template_bones();
        let (names, parents, locals) = standard_character(&bones);
        assert_eq!(names.len(), bones.len() + 1);
        assert_eq!(names[0], STANDARD_ROOT);
        assert_eq!(names[1], "Hips");
        assert_eq!(parents[1], Some(0));
        assert_eq!(standard_name("lefthandthumb1_bb_"), "Lefthandthumb1");
        assert_eq!(locals.len(), names.len());
    }
}
