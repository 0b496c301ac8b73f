/// Default history of never-edited images
///
/// The first time an image is opened, every module that is on by default
/// (or forced on, or switched on by the configured workflow) gets a history
/// item with its default parameters, followed by the matching auto-apply
/// presets. The rows go in front of whatever history the image already has.

use std::ops::ControlFlow;
use std::sync::Arc;

use super::blend::BLEND_VERSION;
use super::iop_order::{IopOrderList, IOP_ORDER_CUSTOM};
use super::Develop;
use crate::cache::image_cache::WritePolicy;
use crate::config::{ChromaticAdaptation, Workflow};
use crate::error::HistoryError;
use crate::iop::{params_bytes, raw::Temperature};
use crate::state::data::{ImageFlags, ImageRecord};
use crate::state::history_db::{HistoryRow, PresetFormat};

/// Preset always considered for raw images with a usable matrix
pub const SCENE_REFERRED_PRESET: &str = "scene-referred default";
pub const DISPLAY_REFERRED_PRESET: &str = "display-referred default";
/// Matches no preset name
const NO_WORKFLOW_PRESET: &str = "\t\n";

/// Change timestamp of images whose edit predates the modern white balance
pub const LEGACY_CHANGE_TIMESTAMP: i64 = -1;

fn workflow_preset(image: &ImageRecord, workflow: Workflow) -> &'static str {
    if !image.is_matrix_correction_supported() {
        return NO_WORKFLOW_PRESET;
    }
    match workflow {
        Workflow::SceneReferred => SCENE_REFERRED_PRESET,
        Workflow::DisplayReferred => DISPLAY_REFERRED_PRESET,
        Workflow::None => NO_WORKFLOW_PRESET,
    }
}

/// Format bits the image has, and the exclusion bit it must not match
fn preset_formats(image: &ImageRecord) -> (PresetFormat, PresetFormat) {
    let mut format = if image.is_rawprepare_supported() { PresetFormat::FOR_RAW } else { PresetFormat::FOR_LDR };
    if image.is_hdr() {
        format |= PresetFormat::FOR_HDR;
    }
    let excluded = if image.is_monochrome() { PresetFormat::FOR_NOT_MONO } else { PresetFormat::FOR_NOT_COLOR };
    (format, excluded)
}

impl Develop {
    /// Materialize the default and auto-preset history once per image.
    ///
    /// # Returns
    /// * `true` if this call did it, `false` when it was done before
    pub(crate) fn init_default_history(&mut self) -> Result<bool, HistoryError> {
        if self.image.flags.contains(ImageFlags::AUTO_PRESETS_APPLIED) {
            return Ok(false);
        }
        let imgid = self.image_id;
        let never_edited = self.ctx.library.history_max_num(imgid)?.is_none();

        let mut rows = self.default_module_rows(never_edited)?;
        rows.extend(self.auto_preset_rows()?);

        if !rows.is_empty() {
            let library = &self.ctx.library;
            let count = rows.len() as i32;
            let end = library.history_get_end(imgid)?;
            library.history_shift_nums(imgid, count)?;
            for (num, row) in rows.iter_mut().enumerate() {
                row.num = num as i32;
                library.history_upsert_item(row)?;
            }
            library.history_set_end(imgid, end + count)?;
            tracing::debug!("[history] {} default items inserted for image {}", count, imgid);
        }

        let mut img = self.ctx.image_cache.write(imgid).ok_or(HistoryError::UnknownImage(imgid))?;
        img.flags |= ImageFlags::AUTO_PRESETS_APPLIED | ImageFlags::NO_LEGACY_PRESETS;
        img.refresh_derived();
        self.image = (*img).clone();
        img.release(WritePolicy::Safe)?;
        self.image.self_hash = self.image.significant_hash();
        Ok(true)
    }

    /// One row per base instance that is on for this image without the user asking.
    fn default_module_rows(&mut self, never_edited: bool) -> Result<Vec<HistoryRow>, HistoryError> {
        let imgid = self.image_id;
        let env = self.ctx.defaults_env();
        let library = Arc::clone(&self.ctx.library);
        let legacy_white_balance = never_edited
            && self.image.change_timestamp == LEGACY_CHANGE_TIMESTAMP
            && self.image.is_raw()
            && self.image.color_matrix.is_some();

        let mut rows = Vec::new();
        for module in self.iop.iter_mut().filter(|m| m.multi_priority == 0) {
            module.reload_defaults(&self.image, &env);
            if library.check_module_exists(imgid, module.op(), false)? {
                continue;
            }
            let forced = module.force_enabled(&self.image);

            if module.leaves_no_history() {
                if module.default_enabled || forced {
                    module.enabled = true;
                }
                continue;
            }

            let params = if module.default_enabled || forced {
                if module.op() == "temperature" && legacy_white_balance {
                    tracing::debug!("[history] legacy white balance for image {}", imgid);
                    params_bytes(&Temperature::defaults_for(&self.image, ChromaticAdaptation::Legacy))
                } else {
                    module.default_params.clone()
                }
            } else if module.workflow_enabled && never_edited {
                module.enabled = true;
                module.default_params.clone()
            } else {
                continue;
            };

            rows.push(HistoryRow {
                imgid,
                num: 0,
                module_version: module.version(),
                operation: Some(module.op().to_string()),
                op_params: params,
                enabled: true,
                blendop_params: module.default_blend_params.as_bytes().to_vec(),
                blendop_version: BLEND_VERSION,
                multi_priority: 0,
                multi_name: String::new(),
                preset_name: None,
            });
        }
        Ok(rows)
    }

    /// Rows of the matching auto-apply presets. Also settles the module
    /// order of images that have none yet.
    fn auto_preset_rows(&mut self) -> Result<Vec<HistoryRow>, HistoryError> {
        let imgid = self.image_id;
        let library = Arc::clone(&self.ctx.library);
        let (format, excluded) = preset_formats(&self.image);
        let preset = workflow_preset(&self.image, self.ctx.config.workflow);

        let mut rows = Vec::new();
        library.history_for_each_auto_preset(imgid, &self.image, preset, format, excluded, |mut row| {
            match row.operation.as_deref().and_then(|op| self.base_module(op)) {
                Some(module) => {
                    if row.blendop_params.is_empty() {
                        row.blendop_params = module.default_blend_params.as_bytes().to_vec();
                        row.blendop_version = BLEND_VERSION;
                    }
                    let op = module.op();
                    tracing::debug!(
                        "[history] auto-applying preset `{}' ({}) to image {}",
                        row.preset_name.as_deref().unwrap_or(""),
                        op,
                        imgid
                    );
                    rows.push(row);
                }
                None => tracing::warn!(
                    "[history] preset for unknown module `{}' not applied",
                    row.operation.as_deref().unwrap_or("")
                ),
            }
            ControlFlow::Continue(())
        })?;

        if !library.module_order_exists(imgid)? {
            let list = library
                .history_get_autoapply_ioporder(imgid, &self.image, format, excluded)?
                .and_then(|blob| {
                    let text = String::from_utf8(blob).ok()?;
                    IopOrderList::parse(IOP_ORDER_CUSTOM, &text)
                })
                .unwrap_or_default();
            library.module_order_set(imgid, list.version, &list.serialize())?;
            self.iop_order_list = list;
            for module in &mut self.iop {
                module.iop_order = self.iop_order_list.get(module.op(), module.multi_priority);
            }
            self.sort_iop();
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixture;
    use crate::develop::iop_order::PIPELINE_ORDER;
    use crate::iop::correct::ExposureParams;
    use crate::iop::decode;
    use crate::state::history_db::Preset;

    #[test]
    fn test_fresh_raw_first_open() {
        let ctx = fixture::context();
        let imgid = fixture::add_raw(&ctx);
        let dev = Develop::load(ctx.clone(), imgid).unwrap();

        let ops: Vec<&str> = dev.history.iter().map(|h| h.op_name.as_str()).collect();
        assert_eq!(
            ops,
            vec!["rawprepare", "temperature", "highlights", "demosaic", "flip", "exposure", "colorin", "colorout"]
        );
        let ranks: Vec<usize> =
            ops.iter().map(|op| PIPELINE_ORDER.iter().position(|p| p == op).unwrap()).collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(dev.history_end, dev.history.len());
        assert!(dev.image.flags.contains(ImageFlags::AUTO_PRESETS_APPLIED));
        assert!(ctx.library.image_flags(imgid).unwrap().unwrap().contains(ImageFlags::AUTO_PRESETS_APPLIED));
        // gamma runs but is never recorded
        assert!(dev.find_module("gamma", 0).unwrap().enabled);

        let again = Develop::load(ctx, imgid).unwrap();
        assert_eq!(again.history, dev.history);
        assert_eq!(again.history_end, dev.history_end);
    }

    #[test]
    fn test_ldr_gets_no_raw_modules() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "a.jpg", ImageFlags::LDR);
        let dev = Develop::load(ctx, imgid).unwrap();
        let ops: Vec<&str> = dev.history.iter().map(|h| h.op_name.as_str()).collect();
        assert_eq!(ops, vec!["flip", "colorin", "colorout"]);
    }

    #[test]
    fn test_defaults_go_before_existing_history() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "b.jpg", ImageFlags::LDR);
        let exposure = crate::iop::correct::Exposure;
        let mut params: ExposureParams = decode(
            &crate::develop::module::IopDefinition::reload_defaults(
                &exposure,
                &ImageRecord::default(),
                &ctx.defaults_env(),
            )
            .params,
        )
        .unwrap();
        params.exposure = 1.25;
        ctx.library
            .history_upsert_item(&HistoryRow {
                imgid,
                num: 0,
                module_version: 6,
                operation: Some("exposure".to_string()),
                op_params: bytemuck::bytes_of(&params).to_vec(),
                enabled: true,
                ..Default::default()
            })
            .unwrap();
        ctx.library.history_set_end(imgid, 1).unwrap();

        let dev = Develop::load(ctx, imgid).unwrap();
        let ops: Vec<&str> = dev.history.iter().map(|h| h.op_name.as_str()).collect();
        assert_eq!(ops, vec!["flip", "colorin", "colorout", "exposure"]);
        assert_eq!(dev.history_end, 4);
        let module: ExposureParams = decode(&dev.find_module("exposure", 0).unwrap().params).unwrap();
        assert_eq!(module.exposure, 1.25);
    }

    #[test]
    fn test_auto_presets() {
        let ctx = fixture::context();
        let mut params: ExposureParams = bytemuck::Zeroable::zeroed();
        params.exposure = 0.5;
        ctx.library
            .insert_preset(&Preset {
                name: "nikon boost".to_string(),
                operation: "exposure".to_string(),
                op_version: 6,
                op_params: bytemuck::bytes_of(&params).to_vec(),
                maker: "Nikon%".to_string(),
                autoapply: true,
                ..Default::default()
            })
            .unwrap();
        ctx.library
            .insert_preset(&Preset {
                name: "canon only".to_string(),
                operation: "tonecurve".to_string(),
                op_version: 5,
                maker: "Canon%".to_string(),
                autoapply: true,
                ..Default::default()
            })
            .unwrap();
        ctx.library
            .insert_preset(&Preset {
                name: "custom order".to_string(),
                operation: "ioporder".to_string(),
                op_params: PIPELINE_ORDER
                    .iter()
                    .rev()
                    .map(|op| format!("{op},0"))
                    .collect::<Vec<_>>()
                    .join(",")
                    .into_bytes(),
                autoapply: true,
                ..Default::default()
            })
            .unwrap();

        let imgid = fixture::add_image(&ctx, "c.jpg", ImageFlags::LDR);
        let dev = Develop::load(ctx.clone(), imgid).unwrap();
        let ops: Vec<&str> = dev.history.iter().map(|h| h.op_name.as_str()).collect();
        assert_eq!(ops.last(), Some(&"exposure"));
        assert!(!ops.contains(&"tonecurve"));
        let module: ExposureParams = decode(&dev.find_module("exposure", 0).unwrap().params).unwrap();
        assert_eq!(module.exposure, 0.5);

        assert_eq!(dev.iop_order_list.version, IOP_ORDER_CUSTOM);
        assert_eq!(dev.iop_order_list.entries[0].operation, "gamma");
        assert_eq!(dev.iop.first().map(|m| m.op()), Some("gamma"));
    }

    #[test]
    fn test_legacy_white_balance() {
        let ctx = fixture::context();
        let imgid = fixture::add_raw(&ctx);
        let mut img = ctx.library.load_image(imgid).unwrap().unwrap();
        img.change_timestamp = LEGACY_CHANGE_TIMESTAMP;
        ctx.library.update_image(&img).unwrap();

        let dev = Develop::load(ctx, imgid).unwrap();
        let item = dev.history.iter().find(|h| h.op_name == "temperature").unwrap();
        let params: crate::iop::raw::TemperatureParams = decode(&item.params).unwrap();
        assert_eq!(params.preset, crate::iop::raw::WB_PRESET_AS_SHOT);
        assert_eq!(params.red, 2.0);
    }

    #[test]
    fn test_preset_formats() {
        let raw = ImageRecord { flags: ImageFlags::RAW | ImageFlags::MONOCHROME, ..Default::default() };
        assert_eq!(preset_formats(&raw), (PresetFormat::FOR_RAW, PresetFormat::FOR_NOT_MONO));
        let ldr = ImageRecord { flags: ImageFlags::LDR, ..Default::default() };
        assert_eq!(preset_formats(&ldr), (PresetFormat::FOR_LDR, PresetFormat::FOR_NOT_COLOR));
        assert_eq!(workflow_preset(&ldr, Workflow::SceneReferred), NO_WORKFLOW_PRESET);
    }
}
