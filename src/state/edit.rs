/// Sidecar document for non-destructive edits
///
/// The stored edit of one image (history rows, mask states, module order and
/// cursor) plus the few image attributes worth carrying with it. It is
/// serialized to JSON next to the raw file as `<raw file>.history.json`,
/// so an edit survives a lost catalog and can be re-applied to another image.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data::ImageFlags;
use super::history_db::{HistoryRow, MaskRow, StoredHistory};
use super::library::Library;
use crate::error::StoreError;

/// Format version of the sidecar document
pub const SIDECAR_VERSION: u32 = 1;

/// Extension appended to the raw file name
pub const SIDECAR_EXTENSION: &str = "history.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SidecarEntry {
    pub num: i32,
    pub operation: String,
    pub module_version: i32,
    pub enabled: bool,
    pub multi_priority: i32,
    pub multi_name: String,
    pub params: Vec<u8>,
    pub blend_version: i32,
    pub blend_params: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SidecarMask {
    pub num: i32,
    pub formid: u32,
    pub form_type: i32,
    pub name: String,
    pub version: i32,
    pub points: Vec<u8>,
    pub points_count: i32,
    pub source: [f32; 2],
}

/// Everything the sidecar file holds
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SidecarDocument {
    pub version: u32,
    pub image_id: i32,
    pub folder: String,
    pub filename: String,

    // ========== Image attributes ==========
    pub flags: ImageFlags,
    pub rating: i8,
    pub color_labels: u8,

    // ========== Edit ==========
    pub history_end: i32,
    pub history_hash: u64,
    /// `(version, serialized list)`
    pub iop_order: Option<(i32, String)>,
    pub history: Vec<SidecarEntry>,
    pub masks: Vec<SidecarMask>,
}

impl SidecarDocument {
    /// Read the stored edit of `imgid` from the catalog.
    ///
    /// # Returns
    /// * `None` when the image does not exist
    pub fn collect(library: &Library, imgid: i32) -> Result<Option<Self>, StoreError> {
        let Some(image) = library.load_image(imgid)? else {
            return Ok(None);
        };
        let stored = library.snapshot_stored_history(imgid)?;

        let history = stored
            .rows
            .into_iter()
            .filter_map(|row| {
                Some(SidecarEntry {
                    num: row.num,
                    operation: row.operation?,
                    module_version: row.module_version,
                    enabled: row.enabled,
                    multi_priority: row.multi_priority,
                    multi_name: row.multi_name,
                    params: row.op_params,
                    blend_version: row.blendop_version,
                    blend_params: row.blendop_params,
                })
            })
            .collect();

        let masks = stored
            .masks
            .into_iter()
            .map(|m| SidecarMask {
                num: m.num,
                formid: m.formid,
                form_type: m.form_type,
                name: m.name,
                version: m.version,
                points: m.points,
                points_count: m.points_count,
                source: m.source,
            })
            .collect();

        Ok(Some(Self {
            version: SIDECAR_VERSION,
            image_id: imgid,
            folder: image.folder.clone(),
            filename: image.filename.clone(),
            flags: image.flags,
            rating: image.rating,
            color_labels: image.color_labels,
            history_end: stored.history_end,
            history_hash: image.history_hash,
            iop_order: stored.module_order,
            history,
            masks,
        }))
    }

    /// The edit part as store rows for image `imgid`
    pub fn to_stored(&self, imgid: i32) -> StoredHistory {
        StoredHistory {
            rows: self
                .history
                .iter()
                .map(|e| HistoryRow {
                    imgid,
                    num: e.num,
                    module_version: e.module_version,
                    operation: Some(e.operation.clone()),
                    op_params: e.params.clone(),
                    enabled: e.enabled,
                    blendop_params: e.blend_params.clone(),
                    blendop_version: e.blend_version,
                    multi_priority: e.multi_priority,
                    multi_name: e.multi_name.clone(),
                    preset_name: None,
                })
                .collect(),
            masks: self
                .masks
                .iter()
                .map(|m| MaskRow {
                    num: m.num,
                    formid: m.formid,
                    form_type: m.form_type,
                    name: m.name.clone(),
                    version: m.version,
                    points: m.points.clone(),
                    points_count: m.points_count,
                    source: m.source,
                })
                .collect(),
            module_order: self.iop_order.clone(),
            history_end: self.history_end.clamp(0, self.history.len() as i32),
        }
    }

    /// Replace the stored edit of `imgid` with this document's.
    pub fn apply(&self, library: &Library, imgid: i32) -> Result<(), StoreError> {
        library.restore_stored_history(imgid, &self.to_stored(imgid))
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// No history at all: the image shows the original
    pub fn is_unedited(&self) -> bool {
        self.history.is_empty() || self.history_end == 0
    }

    /// Where the sidecar of `fullpath` lives
    pub fn path_for(fullpath: &Path) -> PathBuf {
        let mut name = fullpath.as_os_str().to_owned();
        name.push(".");
        name.push(SIDECAR_EXTENSION);
        PathBuf::from(name)
    }

    pub fn read_from(path: &Path) -> Result<Self, StoreError> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}
