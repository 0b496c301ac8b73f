/// History, mask history, module order and preset access
///
/// Rows are handed out as plain values; decoding parameter blobs is the
/// business of the develop layer.
use bitflags::bitflags;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;

use super::data::ImageRecord;
use super::library::Library;
use crate::error::{SqlContext, StoreError};

/// Operations the auto-preset walker never applies as history items
pub const AUTO_PRESET_EXCLUDED_OPS: [&str; 7] = [
    "ioporder",
    "metadata",
    "modulegroups",
    "export",
    "tagging",
    "collect",
    "basecurve",
];

bitflags! {
    /// Image formats a preset applies to (`presets.format`)
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PresetFormat: u32 {
        const FOR_LDR = 1;
        const FOR_RAW = 2;
        const FOR_HDR = 4;
        const FOR_NOT_MONO = 8;
        const FOR_NOT_COLOR = 16;
    }
}

/// One stored history row (or an auto-apply preset shaped like one)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryRow {
    pub imgid: i32,
    pub num: i32,
    pub module_version: i32,
    /// `None` only for corrupt rows
    pub operation: Option<String>,
    pub op_params: Vec<u8>,
    pub enabled: bool,
    pub blendop_params: Vec<u8>,
    pub blendop_version: i32,
    pub multi_priority: i32,
    pub multi_name: String,
    /// Set when the row comes from a preset
    pub preset_name: Option<String>,
}

impl HistoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            imgid: row.get(0)?,
            num: row.get(1)?,
            module_version: row.get::<_, Option<i32>>(2)?.unwrap_or(0),
            operation: row.get(3)?,
            op_params: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
            enabled: row.get::<_, Option<i32>>(5)?.unwrap_or(0) != 0,
            blendop_params: row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default(),
            blendop_version: row.get::<_, Option<i32>>(7)?.unwrap_or(0),
            multi_priority: row.get::<_, Option<i32>>(8)?.unwrap_or(0),
            multi_name: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            preset_name: row.get(10)?,
        })
    }
}

/// One stored mask state, attached to history item `num`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaskRow {
    pub num: i32,
    pub formid: u32,
    pub form_type: i32,
    pub name: String,
    pub version: i32,
    /// JSON encoding of the shape geometry
    pub points: Vec<u8>,
    pub points_count: i32,
    pub source: [f32; 2],
}

impl MaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let source: Option<Vec<u8>> = row.get(7)?;
        Ok(Self {
            num: row.get(0)?,
            formid: row.get::<_, i64>(1)? as u32,
            form_type: row.get::<_, Option<i32>>(2)?.unwrap_or(0),
            name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            version: row.get::<_, Option<i32>>(4)?.unwrap_or(0),
            points: row.get::<_, Option<Vec<u8>>>(5)?.unwrap_or_default(),
            points_count: row.get::<_, Option<i32>>(6)?.unwrap_or(0),
            source: source
                .as_deref()
                .and_then(|blob| bytemuck::try_pod_read_unaligned::<[f32; 2]>(blob).ok())
                .unwrap_or_default(),
        })
    }
}

/// Short description of one history item, for listings
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySummary {
    pub num: i32,
    pub operation: String,
    pub enabled: bool,
    pub multi_name: String,
}

/// Everything stored about an image's edit, used for lighttable undo
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoredHistory {
    pub rows: Vec<HistoryRow>,
    pub masks: Vec<MaskRow>,
    pub module_order: Option<(i32, String)>,
    pub history_end: i32,
}

/// A user or built-in preset row
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub name: String,
    pub operation: String,
    pub op_version: i32,
    pub op_params: Vec<u8>,
    pub enabled: bool,
    pub blendop_params: Vec<u8>,
    pub blendop_version: i32,
    pub multi_priority: i32,
    pub multi_name: String,
    /// `LIKE` patterns
    pub model: String,
    pub maker: String,
    pub lens: String,
    pub iso: (f32, f32),
    pub exposure: (f32, f32),
    pub aperture: (f32, f32),
    pub focal_length: (f32, f32),
    pub writeprotect: bool,
    pub autoapply: bool,
    pub format: PresetFormat,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            name: String::new(),
            operation: String::new(),
            op_version: 1,
            op_params: Vec::new(),
            enabled: true,
            blendop_params: Vec::new(),
            blendop_version: 0,
            multi_priority: 0,
            multi_name: String::new(),
            model: "%".to_string(),
            maker: "%".to_string(),
            lens: "%".to_string(),
            iso: (0.0, f32::MAX),
            exposure: (0.0, f32::MAX),
            aperture: (0.0, f32::MAX),
            focal_length: (0.0, f32::MAX),
            writeprotect: false,
            autoapply: false,
            format: PresetFormat::empty(),
        }
    }
}

const HISTORY_ROW_COLUMNS: &str = "imgid, num, module, operation, op_params, enabled, \
     blendop_params, blendop_version, multi_priority, multi_name, NULL";

const AUTO_PRESET_MATCH: &str = "autoapply = 1
          AND ?2 LIKE model AND ?3 LIKE maker AND ?4 LIKE lens
          AND ?5 BETWEEN iso_min AND iso_max
          AND ?6 BETWEEN exposure_min AND exposure_max
          AND ?7 BETWEEN aperture_min AND aperture_max
          AND ?8 BETWEEN focal_length_min AND focal_length_max
          AND (format = 0 OR (format & ?9 != 0 AND ~format & ?10 != 0))";

impl Library {
    // ========== History rows ==========

    /// Remove all history, masks, module order and hash rows of an image,
    /// then reset its cursor and aspect ratio.
    pub fn history_delete(&self, imgid: i32) -> Result<(), StoreError> {
        let conn = self.conn();
        for sql in [
            "DELETE FROM history WHERE imgid = ?1",
            "DELETE FROM module_order WHERE imgid = ?1",
            "DELETE FROM masks_history WHERE imgid = ?1",
            "DELETE FROM history_hash WHERE imgid = ?1",
            "UPDATE images SET history_end = 0, aspect_ratio = 0.0 WHERE id = ?1",
        ] {
            conn.prepare_cached(sql)
                .ctx("history_delete")?
                .execute([imgid])
                .ctx("history_delete")?;
        }
        Ok(())
    }

    /// Stored cursor, 0 when the image is unknown
    pub fn history_get_end(&self, imgid: i32) -> Result<i32, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT history_end FROM images WHERE id = ?1")
            .ctx("history_get_end")?;
        let end = stmt
            .query_row([imgid], |row| row.get::<_, Option<i32>>(0))
            .optional()
            .ctx("history_get_end")?;
        Ok(end.flatten().unwrap_or(0))
    }

    /// Returns whether the image row exists.
    pub fn history_set_end(&self, imgid: i32, end: i32) -> Result<bool, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("UPDATE images SET history_end = ?1 WHERE id = ?2")
            .ctx("history_set_end")?;
        let changed = stmt.execute(params![end, imgid]).ctx("history_set_end")?;
        Ok(changed > 0)
    }

    /// `max(num) + 1`, or 0 for an empty history
    pub fn history_next_num(&self, imgid: i32) -> Result<i32, StoreError> {
        Ok(self.history_max_num(imgid)?.map_or(0, |max| max + 1))
    }

    pub fn history_max_num(&self, imgid: i32) -> Result<Option<i32>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT MAX(num) FROM history WHERE imgid = ?1")
            .ctx("history_max_num")?;
        stmt.query_row([imgid], |row| row.get(0)).ctx("history_max_num")
    }

    /// Insert or replace the row at `(row.imgid, row.num)`.
    pub fn history_upsert_item(&self, row: &HistoryRow) -> Result<(), StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO history
                   (imgid, num, module, operation, op_params, enabled,
                    blendop_params, blendop_version, multi_priority, multi_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (imgid, num)
                 DO UPDATE SET module = ?3, operation = ?4, op_params = ?5, enabled = ?6,
                               blendop_params = ?7, blendop_version = ?8,
                               multi_priority = ?9, multi_name = ?10",
            )
            .ctx("history_upsert_item")?;
        stmt.execute(params![
            row.imgid,
            row.num,
            row.module_version,
            row.operation,
            row.op_params,
            row.enabled,
            row.blendop_params,
            row.blendop_version,
            row.multi_priority,
            row.multi_name,
        ])
        .ctx("history_upsert_item")?;
        Ok(())
    }

    /// Add `delta` to every history and mask `num` of the image.
    ///
    /// Goes through negative values so the `(imgid, num)` index never sees
    /// two rows with the same number halfway through the update.
    pub fn history_shift_nums(&self, imgid: i32, delta: i32) -> Result<(), StoreError> {
        if delta == 0 {
            return Ok(());
        }
        let conn = self.conn();
        for sql in [
            "UPDATE history SET num = -(num + ?2) - 1 WHERE imgid = ?1",
            "UPDATE history SET num = -num - 1 WHERE imgid = ?1",
            "UPDATE masks_history SET num = num + ?2 WHERE imgid = ?1",
        ] {
            let mut stmt = conn.prepare_cached(sql).ctx("history_shift_nums")?;
            if sql.contains("?2") {
                stmt.execute(params![imgid, delta]).ctx("history_shift_nums")?;
            } else {
                stmt.execute([imgid]).ctx("history_shift_nums")?;
            }
        }
        Ok(())
    }

    /// Walk the stored history ordered by `num`. The callback may stop early.
    pub fn history_for_each<F>(&self, imgid: i32, mut callback: F) -> Result<(), StoreError>
    where
        F: FnMut(HistoryRow) -> ControlFlow<()>,
    {
        let conn = self.conn();
        let sql = format!("SELECT {HISTORY_ROW_COLUMNS} FROM history WHERE imgid = ?1 ORDER BY num");
        let mut stmt = conn.prepare_cached(&sql).ctx("history_for_each")?;
        let mut rows = stmt.query([imgid]).ctx("history_for_each")?;
        while let Some(row) = rows.next().ctx("history_for_each")? {
            let row = HistoryRow::from_row(row).ctx("history_for_each")?;
            if callback(row).is_break() {
                break;
            }
        }
        Ok(())
    }

    pub fn history_rows(&self, imgid: i32) -> Result<Vec<HistoryRow>, StoreError> {
        let mut rows = Vec::new();
        self.history_for_each(imgid, |row| {
            rows.push(row);
            ControlFlow::Continue(())
        })?;
        Ok(rows)
    }

    /// Walk the auto-apply presets matching the image, plus `workflow_preset`
    /// which is always considered. Rows come out as history rows at `num = 0`.
    pub fn history_for_each_auto_preset<F>(
        &self,
        imgid: i32,
        image: &ImageRecord,
        workflow_preset: &str,
        format: PresetFormat,
        excluded: PresetFormat,
        mut callback: F,
    ) -> Result<(), StoreError>
    where
        F: FnMut(HistoryRow) -> ControlFlow<()>,
    {
        let excluded_ops = AUTO_PRESET_EXCLUDED_OPS
            .iter()
            .map(|op| format!("'{op}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT ?1, 0, op_version, operation, op_params, enabled,
                    blendop_params, blendop_version, multi_priority, multi_name, name
               FROM presets
              WHERE (({AUTO_PRESET_MATCH}) OR name = ?11)
                AND operation NOT IN ({excluded_ops})
              ORDER BY writeprotect DESC, LENGTH(model), LENGTH(maker), LENGTH(lens)"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql).ctx("history_for_each_auto_preset")?;
        let mut rows = stmt
            .query(params![
                imgid,
                image.exif.model,
                image.exif.maker,
                image.exif.lens,
                image.exif.iso,
                image.exif.exposure,
                image.exif.aperture,
                image.exif.focal_length,
                format.bits(),
                excluded.bits(),
                workflow_preset,
            ])
            .ctx("history_for_each_auto_preset")?;
        while let Some(row) = rows.next().ctx("history_for_each_auto_preset")? {
            let row = HistoryRow::from_row(row).ctx("history_for_each_auto_preset")?;
            if callback(row).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Parameters of the best matching auto-apply `ioporder` preset
    pub fn history_get_autoapply_ioporder(
        &self,
        imgid: i32,
        image: &ImageRecord,
        format: PresetFormat,
        excluded: PresetFormat,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let sql = format!(
            "SELECT op_params, ?1
               FROM presets
              WHERE {AUTO_PRESET_MATCH}
                AND operation = 'ioporder'
              ORDER BY writeprotect DESC, LENGTH(model), LENGTH(maker), LENGTH(lens)
              LIMIT 1"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql).ctx("history_get_autoapply_ioporder")?;
        stmt.query_row(
            params![
                imgid,
                image.exif.model,
                image.exif.maker,
                image.exif.lens,
                image.exif.iso,
                image.exif.exposure,
                image.exif.aperture,
                image.exif.focal_length,
                format.bits(),
                excluded.bits(),
            ],
            |row| row.get(0),
        )
        .optional()
        .ctx("history_get_autoapply_ioporder")
    }

    /// Whether the history holds `op`. With `enabled` set, only enabled rows count.
    pub fn check_module_exists(&self, imgid: i32, op: &str, enabled: bool) -> Result<bool, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT imgid FROM history
                  WHERE imgid = ?1 AND operation = ?2 AND enabled IN (1, ?3)
                  LIMIT 1",
            )
            .ctx("check_module_exists")?;
        stmt.exists(params![imgid, op, enabled])
            .ctx("check_module_exists")
    }

    /// Latest row per module instance, newest first, skipping the mask manager.
    pub fn history_items(&self, imgid: i32, enabled_only: bool) -> Result<Vec<HistorySummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT MAX(num), operation, enabled, multi_name
                   FROM history
                  WHERE imgid = ?1
                    AND num IN (SELECT MAX(num) FROM history AS hst2
                                 WHERE hst2.imgid = ?1
                                   AND hst2.operation = history.operation
                                 GROUP BY multi_priority)
                    AND operation != 'mask_manager'
                    AND (?2 = 0 OR enabled = 1)
                  GROUP BY operation, multi_priority
                  ORDER BY num DESC",
            )
            .ctx("history_items")?;
        let items = stmt
            .query_map(params![imgid, enabled_only], |row| {
                Ok(HistorySummary {
                    num: row.get(0)?,
                    operation: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    enabled: row.get::<_, Option<i32>>(2)?.unwrap_or(0) != 0,
                    multi_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                })
            })
            .ctx("history_items")?
            .collect::<Result<Vec<_>, _>>()
            .ctx("history_items")?;
        Ok(items)
    }

    /// Every row, newest first
    pub fn history_rows_newest_first(&self, imgid: i32) -> Result<Vec<HistorySummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT num, operation, enabled, multi_name
                   FROM history
                  WHERE imgid = ?1
                  ORDER BY num DESC",
            )
            .ctx("history_rows_newest_first")?;
        let items = stmt
            .query_map([imgid], |row| {
                Ok(HistorySummary {
                    num: row.get(0)?,
                    operation: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    enabled: row.get::<_, Option<i32>>(2)?.unwrap_or(0) != 0,
                    multi_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                })
            })
            .ctx("history_rows_newest_first")?
            .collect::<Result<Vec<_>, _>>()
            .ctx("history_rows_newest_first")?;
        Ok(items)
    }

    // ========== Mask history ==========

    pub fn write_mask(&self, imgid: i32, mask: &MaskRow) -> Result<(), StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO masks_history
                   (imgid, num, formid, form, name, version, points, points_count, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .ctx("write_mask")?;
        stmt.execute(params![
            imgid,
            mask.num,
            i64::from(mask.formid),
            mask.form_type,
            mask.name,
            mask.version,
            mask.points,
            mask.points_count,
            bytemuck::cast_slice::<f32, u8>(&mask.source),
        ])
        .ctx("write_mask")?;
        Ok(())
    }

    /// Walk the stored mask states ordered by `num`.
    pub fn masks_for_each<F>(&self, imgid: i32, mut callback: F) -> Result<(), StoreError>
    where
        F: FnMut(MaskRow) -> ControlFlow<()>,
    {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT num, formid, form, name, version, points, points_count, source
                   FROM masks_history
                  WHERE imgid = ?1
                  ORDER BY num, rowid",
            )
            .ctx("masks_for_each")?;
        let mut rows = stmt.query([imgid]).ctx("masks_for_each")?;
        while let Some(row) = rows.next().ctx("masks_for_each")? {
            let mask = MaskRow::from_row(row).ctx("masks_for_each")?;
            if callback(mask).is_break() {
                break;
            }
        }
        Ok(())
    }

    pub fn mask_rows(&self, imgid: i32) -> Result<Vec<MaskRow>, StoreError> {
        let mut masks = Vec::new();
        self.masks_for_each(imgid, |mask| {
            masks.push(mask);
            ControlFlow::Continue(())
        })?;
        Ok(masks)
    }

    // ========== Module order ==========

    /// `(version, serialized list)` of the image's module order
    pub fn module_order_get(&self, imgid: i32) -> Result<Option<(i32, String)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT version, iop_list FROM module_order WHERE imgid = ?1")
            .ctx("module_order_get")?;
        stmt.query_row([imgid], |row| {
            Ok((
                row.get::<_, Option<i32>>(0)?.unwrap_or(0),
                row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            ))
        })
        .optional()
        .ctx("module_order_get")
    }

    pub fn module_order_set(&self, imgid: i32, version: i32, list: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO module_order (imgid, version, iop_list)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (imgid) DO UPDATE SET version = ?2, iop_list = ?3",
            )
            .ctx("module_order_set")?;
        stmt.execute(params![imgid, version, list]).ctx("module_order_set")?;
        Ok(())
    }

    pub fn module_order_exists(&self, imgid: i32) -> Result<bool, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT imgid FROM module_order WHERE imgid = ?1")
            .ctx("module_order_exists")?;
        stmt.exists([imgid]).ctx("module_order_exists")
    }

    // ========== Presets ==========

    /// Insert or replace a preset keyed by `(name, operation, op_version)`.
    pub fn insert_preset(&self, preset: &Preset) -> Result<(), StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "INSERT OR REPLACE INTO presets
                   (name, description, operation, op_version, op_params, enabled,
                    blendop_params, blendop_version, multi_priority, multi_name,
                    model, maker, lens, iso_min, iso_max, exposure_min, exposure_max,
                    aperture_min, aperture_max, focal_length_min, focal_length_max,
                    writeprotect, autoapply, filter, def, format)
                 VALUES (?1, '', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, 0, 0, ?23)",
            )
            .ctx("insert_preset")?;
        stmt.execute(params![
            preset.name,
            preset.operation,
            preset.op_version,
            preset.op_params,
            preset.enabled,
            preset.blendop_params,
            preset.blendop_version,
            preset.multi_priority,
            preset.multi_name,
            preset.model,
            preset.maker,
            preset.lens,
            preset.iso.0,
            preset.iso.1,
            preset.exposure.0,
            preset.exposure.1,
            preset.aperture.0,
            preset.aperture.1,
            preset.focal_length.0,
            preset.focal_length.1,
            preset.writeprotect,
            preset.autoapply,
            preset.format.bits(),
        ])
        .ctx("insert_preset")?;
        Ok(())
    }

    // ========== Whole-edit snapshots ==========

    /// Copy of every stored row describing the image's edit
    pub fn snapshot_stored_history(&self, imgid: i32) -> Result<StoredHistory, StoreError> {
        Ok(StoredHistory {
            rows: self.history_rows(imgid)?,
            masks: self.mask_rows(imgid)?,
            module_order: self.module_order_get(imgid)?,
            history_end: self.history_get_end(imgid)?,
        })
    }

    /// Replace the stored edit with `stored`. The hash row is left to the caller.
    pub fn restore_stored_history(&self, imgid: i32, stored: &StoredHistory) -> Result<(), StoreError> {
        let (current, mipmap) = self.read_history_hash(imgid)?.unwrap_or((0, 0));
        self.history_delete(imgid)?;
        for row in &stored.rows {
            let mut row = row.clone();
            row.imgid = imgid;
            self.history_upsert_item(&row)?;
        }
        for mask in &stored.masks {
            self.write_mask(imgid, mask)?;
        }
        if let Some((version, list)) = &stored.module_order {
            self.module_order_set(imgid, *version, list)?;
        }
        self.history_set_end(imgid, stored.history_end)?;
        self.write_history_hash(imgid, current, mipmap)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::data::{ExifData, ImageFlags};

    fn setup() -> (Library, i32) {
        let library = Library::open_in_memory().unwrap();
        let film = library.insert_film_roll("/photos").unwrap();
        let imgid = library
            .insert_image(&ImageRecord {
                film_id: film,
                filename: "a.nef".to_string(),
                flags: ImageFlags::RAW,
                exif: ExifData {
                    maker: "Nikon".to_string(),
                    model: "Z 6".to_string(),
                    iso: 800.0,
                    exposure: 0.01,
                    aperture: 4.0,
                    focal_length: 50.0,
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        (library, imgid)
    }

    fn row(imgid: i32, num: i32, op: &str) -> HistoryRow {
        HistoryRow {
            imgid,
            num,
            module_version: 1,
            operation: Some(op.to_string()),
            op_params: vec![num as u8; 4],
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_and_iterate() {
        let (library, imgid) = setup();
        assert_eq!(library.history_next_num(imgid).unwrap(), 0);

        library.history_upsert_item(&row(imgid, 0, "exposure")).unwrap();
        library.history_upsert_item(&row(imgid, 1, "tonecurve")).unwrap();
        let mut replaced = row(imgid, 1, "tonecurve");
        replaced.enabled = false;
        library.history_upsert_item(&replaced).unwrap();

        let rows = library.history_rows(imgid).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].operation.as_deref(), Some("exposure"));
        assert!(!rows[1].enabled);
        assert_eq!(library.history_next_num(imgid).unwrap(), 2);
    }

    #[test]
    fn test_for_each_stops_early() {
        let (library, imgid) = setup();
        for num in 0..5 {
            library.history_upsert_item(&row(imgid, num, "exposure")).unwrap();
        }
        let mut seen = 0;
        library
            .history_for_each(imgid, |_| {
                seen += 1;
                if seen == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
            })
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_shift_nums() {
        let (library, imgid) = setup();
        for num in 0..3 {
            library.history_upsert_item(&row(imgid, num, "exposure")).unwrap();
        }
        library.history_shift_nums(imgid, 1).unwrap();
        let nums: Vec<i32> = library.history_rows(imgid).unwrap().iter().map(|r| r.num).collect();
        assert_eq!(nums, vec![1, 2, 3]);
    }

    #[test]
    fn test_end_and_delete() {
        let (library, imgid) = setup();
        library.history_upsert_item(&row(imgid, 0, "exposure")).unwrap();
        library.module_order_set(imgid, 3, "exposure,0").unwrap();
        library.write_history_hash(imgid, 5, 5).unwrap();
        assert!(library.history_set_end(imgid, 1).unwrap());
        assert!(!library.history_set_end(9999, 1).unwrap());
        assert_eq!(library.history_get_end(imgid).unwrap(), 1);

        library.history_delete(imgid).unwrap();
        assert_eq!(library.history_get_end(imgid).unwrap(), 0);
        assert!(library.history_rows(imgid).unwrap().is_empty());
        assert!(!library.module_order_exists(imgid).unwrap());
        assert_eq!(library.read_history_hash(imgid).unwrap(), None);
    }

    #[test]
    fn test_check_module_exists() {
        let (library, imgid) = setup();
        let mut disabled = row(imgid, 0, "flip");
        disabled.enabled = false;
        library.history_upsert_item(&disabled).unwrap();

        assert!(library.check_module_exists(imgid, "flip", false).unwrap());
        assert!(!library.check_module_exists(imgid, "flip", true).unwrap());
        assert!(!library.check_module_exists(imgid, "exposure", false).unwrap());
    }

    #[test]
    fn test_history_items_latest_per_instance() {
        let (library, imgid) = setup();
        library.history_upsert_item(&row(imgid, 0, "exposure")).unwrap();
        library.history_upsert_item(&row(imgid, 1, "mask_manager")).unwrap();
        let mut second = row(imgid, 2, "exposure");
        second.enabled = false;
        library.history_upsert_item(&second).unwrap();
        library.history_upsert_item(&row(imgid, 3, "tonecurve")).unwrap();

        let items = library.history_items(imgid, false).unwrap();
        let ops: Vec<&str> = items.iter().map(|i| i.operation.as_str()).collect();
        assert_eq!(ops, vec!["tonecurve", "exposure"]);
        assert!(!items[1].enabled);

        let enabled = library.history_items(imgid, true).unwrap();
        assert_eq!(enabled.len(), 1);
    }

    #[test]
    fn test_auto_presets_filter() {
        let (library, imgid) = setup();
        let img = library.load_image(imgid).unwrap().unwrap();

        library
            .insert_preset(&Preset {
                name: "nikon look".to_string(),
                operation: "exposure".to_string(),
                autoapply: true,
                maker: "Nikon%".to_string(),
                iso: (100.0, 1600.0),
                ..Default::default()
            })
            .unwrap();
        library
            .insert_preset(&Preset {
                name: "canon look".to_string(),
                operation: "exposure".to_string(),
                autoapply: true,
                maker: "Canon".to_string(),
                ..Default::default()
            })
            .unwrap();
        library
            .insert_preset(&Preset {
                name: "mono only".to_string(),
                operation: "tonecurve".to_string(),
                autoapply: true,
                format: PresetFormat::FOR_RAW | PresetFormat::FOR_NOT_COLOR,
                ..Default::default()
            })
            .unwrap();
        library
            .insert_preset(&Preset {
                name: "workflow".to_string(),
                operation: "flip".to_string(),
                ..Default::default()
            })
            .unwrap();
        library
            .insert_preset(&Preset {
                name: "never".to_string(),
                operation: "basecurve".to_string(),
                autoapply: true,
                ..Default::default()
            })
            .unwrap();

        let mut names = Vec::new();
        library
            .history_for_each_auto_preset(
                imgid,
                &img,
                "workflow",
                PresetFormat::FOR_RAW,
                PresetFormat::FOR_NOT_COLOR,
                |row| {
                    assert_eq!(row.num, 0);
                    assert_eq!(row.imgid, imgid);
                    names.push(row.preset_name.unwrap_or_default());
                    ControlFlow::Continue(())
                },
            )
            .unwrap();
        names.sort();
        assert_eq!(names, vec!["nikon look".to_string(), "workflow".to_string()]);
    }

    #[test]
    fn test_autoapply_ioporder() {
        let (library, imgid) = setup();
        let img = library.load_image(imgid).unwrap().unwrap();
        assert!(library
            .history_get_autoapply_ioporder(imgid, &img, PresetFormat::FOR_RAW, PresetFormat::FOR_NOT_MONO)
            .unwrap()
            .is_none());

        library
            .insert_preset(&Preset {
                name: "order".to_string(),
                operation: "ioporder".to_string(),
                op_params: b"exposure,0".to_vec(),
                autoapply: true,
                ..Default::default()
            })
            .unwrap();
        let params = library
            .history_get_autoapply_ioporder(imgid, &img, PresetFormat::FOR_RAW, PresetFormat::FOR_NOT_MONO)
            .unwrap();
        assert_eq!(params.as_deref(), Some(&b"exposure,0"[..]));
    }

    #[test]
    fn test_masks_and_snapshot() {
        let (library, imgid) = setup();
        library.history_upsert_item(&row(imgid, 0, "spots")).unwrap();
        library
            .write_mask(
                imgid,
                &MaskRow {
                    num: 0,
                    formid: 77,
                    form_type: 1,
                    name: "circle #1".to_string(),
                    version: 6,
                    points: b"{}".to_vec(),
                    points_count: 1,
                    source: [0.25, 0.5],
                },
            )
            .unwrap();
        library.module_order_set(imgid, 5, "spots,0").unwrap();
        library.history_set_end(imgid, 1).unwrap();

        let stored = library.snapshot_stored_history(imgid).unwrap();
        assert_eq!(stored.masks.len(), 1);
        assert_eq!(stored.masks[0].source, [0.25, 0.5]);

        library.history_delete(imgid).unwrap();
        library.restore_stored_history(imgid, &stored).unwrap();
        assert_eq!(library.snapshot_stored_history(imgid).unwrap(), stored);
    }
}
