/// Drawn masks (forms)
///
/// Forms are identified by a stable `formid`. Groups reference their members
/// by id, never by pointer, so a form can be dropped or replaced without
/// dangling references. Points are stored in `masks_history.points` as JSON.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::StoreError;
use crate::hash::ContentHasher;
use crate::state::history_db::MaskRow;

bitflags! {
    /// `masks_history.type` bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MaskType: i32 {
        const CIRCLE = 1;
        const PATH = 2;
        const GROUP = 4;
        const CLONE = 8;
        const GRADIENT = 16;
        const ELLIPSE = 32;
        const BRUSH = 64;
        const NON_CLONE = 128;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CirclePoint {
    pub center: [f32; 2],
    pub radius: f32,
    pub border: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct EllipsePoint {
    pub center: [f32; 2],
    pub radius: [f32; 2],
    pub rotation: f32,
    pub border: f32,
    pub flags: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PathPoint {
    pub corner: [f32; 2],
    pub ctrl1: [f32; 2],
    pub ctrl2: [f32; 2],
    pub border: [f32; 2],
    pub state: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BrushPoint {
    pub corner: [f32; 2],
    pub ctrl1: [f32; 2],
    pub ctrl2: [f32; 2],
    pub border: [f32; 2],
    pub density: f32,
    pub hardness: f32,
    pub state: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GradientPoint {
    pub anchor: [f32; 2],
    pub rotation: f32,
    pub compression: f32,
    pub steepness: f32,
    pub curvature: f32,
    pub state: i32,
}

/// One member of a group
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GroupMember {
    pub formid: u32,
    pub parentid: u32,
    pub state: i32,
    pub opacity: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum MaskShape {
    Circle(CirclePoint),
    Ellipse(EllipsePoint),
    Path(Vec<PathPoint>),
    Brush(Vec<BrushPoint>),
    Gradient(GradientPoint),
    Group(Vec<GroupMember>),
}

impl MaskShape {
    fn type_bits(&self) -> MaskType {
        match self {
            MaskShape::Circle(_) => MaskType::CIRCLE,
            MaskShape::Ellipse(_) => MaskType::ELLIPSE,
            MaskShape::Path(_) => MaskType::PATH,
            MaskShape::Brush(_) => MaskType::BRUSH,
            MaskShape::Gradient(_) => MaskType::GRADIENT,
            MaskShape::Group(_) => MaskType::GROUP,
        }
    }

    fn points_count(&self) -> usize {
        match self {
            MaskShape::Circle(_) | MaskShape::Ellipse(_) | MaskShape::Gradient(_) => 1,
            MaskShape::Path(points) => points.len(),
            MaskShape::Brush(points) => points.len(),
            MaskShape::Group(members) => members.len(),
        }
    }

    fn points_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            MaskShape::Circle(p) => serde_json::to_vec(p),
            MaskShape::Ellipse(p) => serde_json::to_vec(p),
            MaskShape::Path(p) => serde_json::to_vec(p),
            MaskShape::Brush(p) => serde_json::to_vec(p),
            MaskShape::Gradient(p) => serde_json::to_vec(p),
            MaskShape::Group(p) => serde_json::to_vec(p),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MaskForm {
    pub formid: u32,
    pub name: String,
    pub version: i32,
    /// Clone source for retouch forms
    pub source: [f32; 2],
    /// Used as a clone (spot removal) shape
    pub clone: bool,
    pub shape: MaskShape,
}

/// Current form layout version
pub const MASKS_VERSION: i32 = 6;

impl MaskForm {
    pub fn new(formid: u32, name: &str, shape: MaskShape) -> Self {
        Self {
            formid,
            name: name.to_string(),
            version: MASKS_VERSION,
            source: [0.0, 0.0],
            clone: false,
            shape,
        }
    }

    pub fn form_type(&self) -> MaskType {
        let mut bits = self.shape.type_bits();
        if self.clone {
            bits |= MaskType::CLONE;
        }
        bits
    }

    pub fn is_group(&self) -> bool {
        matches!(self.shape, MaskShape::Group(_))
    }

    pub fn members(&self) -> &[GroupMember] {
        match &self.shape {
            MaskShape::Group(members) => members,
            _ => &[],
        }
    }

    /// Row for `masks_history`, attached to history item `num`
    pub fn to_row(&self, num: i32) -> Result<MaskRow, StoreError> {
        Ok(MaskRow {
            num,
            formid: self.formid,
            form_type: self.form_type().bits(),
            name: self.name.clone(),
            version: self.version,
            points: self.shape.points_json()?,
            points_count: self.shape.points_count() as i32,
            source: self.source,
        })
    }

    pub fn from_row(imgid: i32, row: &MaskRow) -> Result<Self, StoreError> {
        let kind = MaskType::from_bits_truncate(row.form_type);
        let corrupt = |_| StoreError::CorruptBlob { what: "mask points", imgid };

        let shape = if kind.contains(MaskType::GROUP) {
            MaskShape::Group(serde_json::from_slice(&row.points).map_err(corrupt)?)
        } else if kind.contains(MaskType::CIRCLE) {
            MaskShape::Circle(serde_json::from_slice(&row.points).map_err(corrupt)?)
        } else if kind.contains(MaskType::ELLIPSE) {
            MaskShape::Ellipse(serde_json::from_slice(&row.points).map_err(corrupt)?)
        } else if kind.contains(MaskType::PATH) {
            MaskShape::Path(serde_json::from_slice(&row.points).map_err(corrupt)?)
        } else if kind.contains(MaskType::BRUSH) {
            MaskShape::Brush(serde_json::from_slice(&row.points).map_err(corrupt)?)
        } else if kind.contains(MaskType::GRADIENT) {
            MaskShape::Gradient(serde_json::from_slice(&row.points).map_err(corrupt)?)
        } else {
            return Err(StoreError::CorruptBlob { what: "mask type", imgid });
        };

        Ok(Self {
            formid: row.formid,
            name: row.name.clone(),
            version: row.version,
            source: row.source,
            clone: kind.contains(MaskType::CLONE),
            shape,
        })
    }

    fn hash_into(&self, h: &mut ContentHasher) {
        h.u32(self.formid).i32(self.form_type().bits()).i32(self.version);
        h.f32(self.source[0]).f32(self.source[1]);
        match self.shape.points_json() {
            Ok(bytes) => h.bytes(&bytes),
            Err(_) => h.bool(false),
        };
    }
}

pub fn get_from_id(forms: &[MaskForm], formid: u32) -> Option<&MaskForm> {
    forms.iter().find(|f| f.formid == formid)
}

/// `root` and every form it reaches through group membership, depth first.
///
/// Each id appears once. A group reached again through its own members is a
/// cycle: it is logged and not followed.
pub fn used_forms(forms: &[MaskForm], root: u32) -> Vec<u32> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![root];

    while let Some(formid) = stack.pop() {
        if !visited.insert(formid) {
            if get_from_id(forms, formid).is_some_and(MaskForm::is_group) {
                tracing::warn!("[masks] group {} is referenced again, cyclic membership ignored", formid);
            }
            continue;
        }
        order.push(formid);
        if let Some(form) = get_from_id(forms, formid) {
            // reversed so members come out in their stored order
            stack.extend(form.members().iter().rev().map(|m| m.formid));
        }
    }
    order
}

/// Hash of the forms reachable from `mask_id`; the seed when there is none.
pub fn forms_hash(forms: &[MaskForm], mask_id: u32) -> u64 {
    let mut h = ContentHasher::new();
    if mask_id == 0 {
        return h.finish();
    }
    for formid in used_forms(forms, mask_id) {
        if let Some(form) = get_from_id(forms, formid) {
            form.hash_into(&mut h);
        }
    }
    h.finish()
}

/// Put `form` in `forms`, replacing a form with the same id.
pub fn replace_or_append(forms: &mut Vec<MaskForm>, form: MaskForm) {
    match forms.iter_mut().find(|f| f.formid == form.formid) {
        Some(existing) => *existing = form,
        None => forms.push(form),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle(formid: u32) -> MaskForm {
        MaskForm::new(
            formid,
            "circle",
            MaskShape::Circle(CirclePoint { center: [0.5, 0.5], radius: 0.1, border: 0.05 }),
        )
    }

    fn group(formid: u32, members: &[u32]) -> MaskForm {
        MaskForm::new(
            formid,
            "group",
            MaskShape::Group(
                members
                    .iter()
                    .map(|&id| GroupMember { formid: id, parentid: formid, state: 1, opacity: 1.0 })
                    .collect(),
            ),
        )
    }

    #[test]
    fn test_row_roundtrip() {
        let mut form = circle(3);
        form.clone = true;
        form.source = [0.2, 0.3];
        let row = form.to_row(4).unwrap();
        assert_eq!(row.num, 4);
        assert_eq!(row.form_type, (MaskType::CIRCLE | MaskType::CLONE).bits());
        assert_eq!(MaskForm::from_row(1, &row).unwrap(), form);
    }

    #[test]
    fn test_unknown_type_is_corrupt() {
        let mut row = circle(3).to_row(0).unwrap();
        row.form_type = 0;
        assert!(matches!(MaskForm::from_row(9, &row), Err(StoreError::CorruptBlob { imgid: 9, .. })));
    }

    #[test]
    fn test_used_forms_follows_groups() {
        let forms = vec![group(10, &[1, 11]), group(11, &[2]), circle(1), circle(2), circle(3)];
        assert_eq!(used_forms(&forms, 10), vec![10, 1, 11, 2]);
        assert_eq!(used_forms(&forms, 3), vec![3]);
    }

    #[test]
    fn test_cyclic_groups_terminate() {
        let forms = vec![group(10, &[11]), group(11, &[10, 1]), circle(1)];
        assert_eq!(used_forms(&forms, 10), vec![10, 11, 1]);
    }

    #[test]
    fn test_forms_hash() {
        let mut forms = vec![group(10, &[1]), circle(1), circle(2)];
        let before = forms_hash(&forms, 10);
        // an unrelated form does not matter
        forms[2].source = [9.0, 9.0];
        assert_eq!(forms_hash(&forms, 10), before);
        // a member does
        forms[1].source = [9.0, 9.0];
        assert_ne!(forms_hash(&forms, 10), before);
        assert_eq!(forms_hash(&forms, 0), crate::hash::HASH_SEED);
    }

    #[test]
    fn test_replace_or_append() {
        let mut forms = vec![circle(1)];
        let mut replacement = circle(1);
        replacement.name = "other".to_string();
        replace_or_append(&mut forms, replacement);
        replace_or_append(&mut forms, circle(2));
        assert_eq!(forms.len(), 2);
        assert_eq!(forms[0].name, "other");
    }
}
