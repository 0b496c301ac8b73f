/// History stack of a develop session
///
/// Items are read from the `history` table, resolved against module
/// instances, dumped into those instances up to the cursor, and written back
/// renumbered from 0. Every item carries its own copy of the drawn forms
/// when its module uses them, so the forms in effect at any cursor position
/// are those of the last item before it that has some.

use std::ops::ControlFlow;
use std::sync::Arc;

use super::blend::{BlendParams, BLEND_VERSION};
use super::masks::MaskForm;
use super::module::{IopModule, ModuleId};
use super::Develop;
use crate::cache::image_cache::WritePolicy;
use crate::control::signals::Signal;
use crate::error::HistoryError;
use crate::state::history_db::HistoryRow;

/// Tag attached to every image with a user edit
pub const CHANGED_TAG: &str = "darktable|changed";

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryItem {
    pub num: i32,
    pub op_name: String,
    pub module_version: i32,
    pub multi_priority: i32,
    pub multi_name: String,
    pub enabled: bool,
    pub iop_order: i32,
    pub params: Vec<u8>,
    pub blend_params: BlendParams,
    /// Snapshot of the drawn forms, for modules that use them
    pub forms: Option<Vec<MaskForm>>,
    /// Module hash right after this item was applied
    pub hash: u64,
    /// Resolved instance, `None` once that instance is gone
    pub module: Option<ModuleId>,
}

impl HistoryItem {
    fn from_module(module: &IopModule, num: i32, forms: Option<Vec<MaskForm>>) -> Self {
        Self {
            num,
            op_name: module.op().to_string(),
            module_version: module.version(),
            multi_priority: module.multi_priority,
            multi_name: module.multi_name.clone(),
            enabled: module.enabled,
            iop_order: module.iop_order,
            params: module.params.clone(),
            blend_params: module.blend_params,
            forms,
            hash: module.hash,
            module: Some(module.id),
        }
    }

    pub fn to_row(&self, imgid: i32, num: i32) -> HistoryRow {
        HistoryRow {
            imgid,
            num,
            module_version: self.module_version,
            operation: Some(self.op_name.clone()),
            op_params: self.params.clone(),
            enabled: self.enabled,
            blendop_params: self.blend_params.as_bytes().to_vec(),
            blendop_version: BLEND_VERSION,
            multi_priority: self.multi_priority,
            multi_name: self.multi_name.clone(),
            preset_name: None,
        }
    }

    fn forms_slice(&self) -> &[MaskForm] {
        self.forms.as_deref().unwrap_or(&[])
    }
}

/// Deep copy of a history stack
pub fn history_duplicate(items: &[HistoryItem]) -> Vec<HistoryItem> {
    items.to_vec()
}

/// How the parameters of a stored row were brought to the current layout
enum ParamsSync {
    Dropped,
    Synced,
    /// Legacy item whose blending must stay at the module defaults
    SyncedKeepBlend,
}

impl Develop {
    /// Read the stored history of `imgid` into this session.
    ///
    /// Materializes the default history first when the image was never
    /// opened. Items are dumped into their instances but the cursor state is
    /// only applied by [`Develop::pop_history_items`].
    ///
    /// # Returns
    /// * `true` on the first run for this image
    pub fn read_history(&mut self, imgid: i32) -> Result<bool, HistoryError> {
        self.load_modules();
        self.load_image(imgid)?;

        self.history.clear();
        self.history_end = 0;

        self.set_default_iop_order()?;
        let first_run = self.init_default_history()?;

        let library = Arc::clone(&self.ctx.library);
        let lease = self.ctx.image_cache.read(imgid).ok_or(HistoryError::UnknownImage(imgid))?;

        let stored_end = library.history_get_end(imgid)?;
        library.history_for_each(imgid, |row| {
            self.process_history_row(row);
            ControlFlow::Continue(())
        })?;

        self.resync_modules_order();
        self.check_iop_order("read_history");

        for row in library.mask_rows(imgid)? {
            let form = match MaskForm::from_row(imgid, &row) {
                Ok(form) => form,
                Err(e) => {
                    tracing::warn!("[history] dropping mask {} of image {}: {}", row.formid, imgid, e);
                    continue;
                }
            };
            match self.history.iter_mut().find(|h| h.num == row.num) {
                Some(item) => item.forms.get_or_insert_with(Vec::new).push(form),
                None => tracing::debug!("[history] mask {} refers to missing item {}", row.formid, row.num),
            }
        }
        drop(lease);

        for idx in 0..self.history.len() {
            if let Some(hash) = self.history_to_module(idx) {
                self.history[idx].hash = hash;
            }
            let item = &self.history[idx];
            tracing::debug!(
                "[history] successfully loaded module {} {}({}) version {} enabled {}",
                item.num,
                item.op_name,
                item.multi_priority,
                item.module_version,
                item.enabled
            );
        }

        if stored_end > 0 {
            self.set_history_end(stored_end as usize);
        }
        self.history_hash = self.get_hash();
        Ok(first_run)
    }

    /// Order list stored for the image, or the built-in one.
    fn set_default_iop_order(&mut self) -> Result<(), HistoryError> {
        let stored = self.ctx.library.module_order_get(self.image_id)?;
        self.iop_order_list = match stored {
            Some((version, text)) => match super::iop_order::IopOrderList::parse(version, &text) {
                Some(list) => list,
                None => {
                    tracing::warn!("[history] malformed module order of image {}, using the default", self.image_id);
                    super::iop_order::IopOrderList::v30()
                }
            },
            None => super::iop_order::IopOrderList::v30(),
        };
        for module in &mut self.iop {
            if module.multi_priority == 0 {
                module.iop_order = self.iop_order_list.get(module.op(), 0);
            }
        }
        self.sort_iop();
        Ok(())
    }

    fn process_history_row(&mut self, row: HistoryRow) {
        let Some(op) = row.operation.clone() else {
            tracing::warn!("[history] item {} of image {} has no operation, dropped", row.num, self.image_id);
            return;
        };
        if row.imgid != self.image_id {
            tracing::warn!("[history] item {} belongs to image {}, not {}", row.num, row.imgid, self.image_id);
            return;
        }

        let Some(idx) = self.resolve_module(&op, row.multi_priority, &row.multi_name) else {
            tracing::warn!(
                "[history] module `{}' of image {} is not installed, item {} ignored",
                op,
                self.image_id,
                row.num
            );
            return;
        };

        let iop_order = self.iop_order_list.get(&op, row.multi_priority);
        let module = &mut self.iop[idx];
        module.enabled = row.enabled;
        module.iop_order = iop_order;
        module.multi_priority = row.multi_priority;

        if module.leaves_no_history() {
            module.compute_hash(&self.forms);
            return;
        }

        let module = &self.iop[idx];
        let mut item = HistoryItem {
            num: row.num,
            op_name: op,
            module_version: module.version(),
            multi_priority: row.multi_priority,
            multi_name: row.multi_name.clone(),
            enabled: row.enabled,
            iop_order,
            params: Vec::new(),
            blend_params: module.default_blend_params,
            forms: None,
            hash: 0,
            module: Some(module.id),
        };

        let sync = sync_params(&mut item, module, &row, self.image_id);
        if matches!(sync, ParamsSync::Dropped) {
            return;
        }

        if let Some(forced) = module.so.force_enable(&self.image, item.enabled) {
            if forced != item.enabled {
                tracing::debug!("[history] {} forced {}", item.op_name, if forced { "on" } else { "off" });
            }
            item.enabled = forced;
        }
        if module.always_on() {
            item.enabled = true;
        }

        if !matches!(sync, ParamsSync::SyncedKeepBlend) {
            sync_blendop_params(&mut item, module, &row);
        }

        self.history.push(item);
        self.history_end = self.history.len();
    }

    /// Instance for `(op, multi_priority)`, created from the base instance
    /// when only the operation is known.
    fn resolve_module(&mut self, op: &str, multi_priority: i32, multi_name: &str) -> Option<usize> {
        if let Some(idx) = self.iop.iter().position(|m| m.op() == op && m.multi_priority == multi_priority) {
            return Some(idx);
        }
        if self.base_module(op).is_none() {
            return None;
        }
        let id = self.alloc_module_id();
        let base = self.base_module(op)?;
        let mut module = base.duplicate_as(id, multi_priority);
        module.multi_name = multi_name.to_string();
        module.iop_order = self.iop_order_list.insert_instance(op, multi_priority);
        tracing::debug!("[history] new instance {}({}) for image {}", op, multi_priority, self.image_id);
        self.iop.push(module);
        Some(self.iop.len() - 1)
    }

    /// Dump item `idx` into its instance.
    ///
    /// # Returns
    /// * the instance hash after the dump, `None` if the instance is gone
    fn history_to_module(&mut self, idx: usize) -> Option<u64> {
        let item = &self.history[idx];
        let midx = item.module.and_then(|id| self.module_index(id))?;
        let module = &mut self.iop[midx];
        module.enabled = item.enabled;
        module.iop_order = item.iop_order;
        module.multi_priority = item.multi_priority;
        module.multi_name.clone_from(&item.multi_name);
        if item.params.len() == module.params.len() {
            module.params.clone_from(&item.params);
        }
        module.blend_params = item.blend_params;
        module.compute_hash(item.forms_slice());
        Some(module.hash)
    }

    /// Apply the items below the cursor to freshly reset instances.
    pub fn pop_history_items(&mut self) {
        let env = self.ctx.defaults_env();
        for module in &mut self.iop {
            module.reload_defaults(&self.image, &env);
            module.iop_order = if module.multi_priority == 0 {
                self.iop_order_list.get(module.op(), 0)
            } else {
                super::iop_order::IOP_ORDER_UNKNOWN
            };
            module.compute_hash(&self.forms);
        }

        for idx in self.history_end..self.history.len() {
            let item = &self.history[idx];
            let Some(midx) = item.module.and_then(|id| self.module_index(id)) else {
                continue;
            };
            let module = &mut self.iop[midx];
            module.enabled = module.default_enabled;
            module.compute_hash(item.forms_slice());
            self.history[idx].hash = module.hash;
        }

        let mut forms: Option<Vec<MaskForm>> = None;
        for idx in 0..self.history_end {
            self.history_to_module(idx);
            match &self.history[idx].forms {
                Some(item_forms) if !item_forms.is_empty() => forms = Some(item_forms.clone()),
                _ => {}
            }
        }
        self.forms = forms.unwrap_or_default();

        self.resync_modules_order();
        self.check_iop_order("pop_history_items");
        self.history_hash = self.get_hash();
    }

    /// Replace the stored history of the image with this session's.
    pub fn write_history(&mut self) -> Result<(), HistoryError> {
        let imgid = self.image_id;
        let mut img = self.ctx.image_cache.write(imgid).ok_or(HistoryError::UnknownImage(imgid))?;
        self.history_hash = self.get_hash();

        let library = Arc::clone(&self.ctx.library);
        library.history_delete(imgid)?;
        for (i, item) in self.history.iter_mut().enumerate() {
            item.num = i as i32;
            library.history_upsert_item(&item.to_row(imgid, item.num))?;
            for form in item.forms_slice() {
                library.write_mask(imgid, &form.to_row(item.num)?)?;
            }
        }
        library.history_set_end(imgid, self.history_end as i32)?;
        library.module_order_set(imgid, self.iop_order_list.version, &self.iop_order_list.serialize())?;

        img.history_hash = self.history_hash;
        img.history_items = self.history.len() as u32;
        img.release(WritePolicy::Safe)?;

        self.image.history_hash = self.history_hash;
        self.image.history_items = self.history.len() as u32;
        tracing::debug!(
            "[history] wrote {} items for image {}, end {}, hash {:#x}",
            self.history.len(),
            imgid,
            self.history_end,
            self.history_hash
        );
        Ok(())
    }

    /// Drop items past the cursor, except mandatory modules the applied part
    /// does not mention.
    fn remove_history_leaks(&mut self) {
        if self.history_end >= self.history.len() {
            return;
        }
        let tail: Vec<HistoryItem> = self.history.drain(self.history_end..).collect();
        for item in tail {
            let mandatory = item
                .module
                .and_then(|id| self.module(id))
                .is_some_and(|m| m.hide_enable_button || m.default_enabled);
            let earlier = self.history.iter().any(|h| h.op_name == item.op_name);
            if mandatory && !earlier {
                tracing::debug!("[history] keeping mandatory {} past the cursor", item.op_name);
                self.history.push(item);
            } else {
                tracing::trace!("[history] removing {}({}) past the cursor", item.op_name, item.multi_priority);
            }
        }
    }

    /// Record the current state of `module` (the mask manager for `None`).
    ///
    /// The last item is overwritten when it belongs to the same instance and
    /// `force_new_item` is off.
    ///
    /// # Returns
    /// * `true` when the item adds a node to the pipe: first item of the
    ///   instance, or its enabled state flipped
    pub fn add_history_item_ext(
        &mut self,
        module: Option<ModuleId>,
        enable: bool,
        force_new_item: bool,
        include_masks: bool,
    ) -> bool {
        let (id, enable, force_new_item) = match module {
            Some(id) => (id, enable, force_new_item),
            None => match self.find_module("mask_manager", 0) {
                Some(manager) => (manager.id, false, false),
                None => return false,
            },
        };

        self.remove_history_leaks();

        let Some(midx) = self.module_index(id) else {
            tracing::warn!("[history] instance {:?} is not part of image {}", id, self.image_id);
            return false;
        };
        if enable {
            self.iop[midx].enabled = true;
        }

        let reuse_last = !force_new_item && self.history.last().is_some_and(|last| last.module == Some(id));
        let add_new_pipe_node = !reuse_last && {
            let enabled = self.iop[midx].enabled;
            self.history
                .iter()
                .rev()
                .find(|h| h.module == Some(id))
                .map_or(true, |previous| previous.enabled != enabled)
        };

        let forms = (include_masks && self.iop[midx].includes_masks()).then(|| self.forms.clone());
        let module = &mut self.iop[midx];
        module.compute_hash(forms.as_deref().unwrap_or(&[]));

        if reuse_last {
            let last = self.history.len() - 1;
            let num = self.history[last].num;
            self.history[last] = HistoryItem::from_module(module, num, forms);
        } else {
            let num = self.history.len() as i32;
            self.history.push(HistoryItem::from_module(module, num, forms));
        }
        self.history_end = self.history.len();
        tracing::debug!(
            "[history] {} item for {}({}) on image {}",
            if reuse_last { "updated" } else { "new" },
            module.op(),
            module.multi_priority,
            self.image_id
        );
        add_new_pipe_node
    }

    /// Commit a parameter change of `module`: undo record, store write,
    /// pipe signal and change notification.
    ///
    /// The pipes hear about the change only once it is stored. A new node
    /// rebuilds them, a change touching masks resyncs them, anything else
    /// updates the nodes whose hash moved.
    pub fn add_history_item(&mut self, module: ModuleId, enable: bool) -> Result<bool, HistoryError> {
        self.pipes_shutdown();

        self.undo_start_record();
        let add_new_pipe_node = self.add_history_item_ext(Some(module), enable, false, true);
        self.undo_end_record();

        self.write_history()?;
        self.ctx.library.attach_tag(self.image_id, CHANGED_TAG)?;

        let needs_resync = self
            .history
            .last()
            .is_some_and(|item| item.forms.as_ref().is_some_and(|f| !f.is_empty()) || item.blend_params.uses_raster_mask());
        if add_new_pipe_node {
            self.pipeline_rebuild_all();
        } else if needs_resync {
            self.pipeline_resync_history_all();
        } else {
            self.pipeline_update_history_all();
        }

        self.notify_change();
        Ok(add_new_pipe_node)
    }

    /// Read the stored history again and apply it.
    pub fn reload_history_items(&mut self) -> Result<(), HistoryError> {
        self.read_history(self.image_id)?;
        self.pop_history_items();
        Ok(())
    }

    /// Committed mask states in the history, counted until `threshold` is exceeded
    pub fn mask_history_overload(&self, threshold: usize) -> usize {
        let mut count = 0;
        for item in &self.history {
            count += item.forms.as_ref().map_or(0, Vec::len);
            if count > threshold {
                break;
            }
        }
        count
    }

    /// Warn about heavy mask histories, then tell listeners the image changed.
    pub fn notify_change(&self) {
        let threshold = self.ctx.config.mask_history_warning_threshold;
        let count = self.mask_history_overload(threshold);
        if count > threshold {
            tracing::warn!(
                "[history] image {} has more than {} mask states in its history, compressing it is advised",
                self.image_id,
                threshold
            );
        }
        self.ctx.signals.raise(Signal::ImageInfoChanged(vec![self.image_id]));
    }

    /// Rebuild the history from the instances in four passes: mandatory
    /// modules, user modules at defaults, user modules with changed
    /// parameters, then disabled modules worth keeping. Items past the
    /// cursor are dropped.
    pub fn compress_history(&mut self) -> Result<(), HistoryError> {
        let had_history: Vec<String> = self.history[..self.history_end].iter().map(|h| h.op_name.clone()).collect();
        self.history.clear();
        self.history_end = 0;

        let image = self.image.clone();
        let passes: [&dyn Fn(&IopModule) -> bool; 4] = [
            &|m| m.enabled && (m.default_enabled || m.force_enabled(&image)),
            &|m| m.enabled && !(m.default_enabled || m.force_enabled(&image)) && m.has_defaults(),
            &|m| m.enabled && !(m.default_enabled || m.force_enabled(&image)) && !m.has_defaults(),
            &|m| !m.enabled && (m.default_enabled || had_history.iter().any(|op| op == m.op())),
        ];
        for pass in passes {
            let ids: Vec<ModuleId> = self
                .iop
                .iter()
                .filter(|m| !m.leaves_no_history() && m.op() != "mask_manager" && pass(m))
                .map(|m| m.id)
                .collect();
            for id in ids {
                self.add_history_item_ext(Some(id), false, true, true);
            }
        }
        if !self.forms.is_empty() {
            self.add_history_item_ext(None, false, true, true);
        }

        self.write_history()?;
        self.reload_history_items()?;
        self.write_history()?;
        tracing::debug!("[history] compressed image {} to {} items", self.image_id, self.history.len());
        Ok(())
    }

    /// Drop every item at or past `end`.
    pub fn truncate_history(&mut self, end: usize) -> Result<(), HistoryError> {
        self.history.truncate(end);
        self.history_end = self.history.len();
        self.write_history()?;
        self.reload_history_items()?;
        self.write_history()
    }
}

fn preset_context(row: &HistoryRow) -> String {
    match &row.preset_name {
        Some(name) => format!("in preset `{name}'"),
        None => format!("in history of image {}", row.imgid),
    }
}

fn sync_params(item: &mut HistoryItem, module: &IopModule, row: &HistoryRow, imgid: i32) -> ParamsSync {
    let so = &module.so;
    if row.module_version == so.version() && row.op_params.len() == so.params_size() {
        item.params.clone_from(&row.op_params);
        return ParamsSync::Synced;
    }

    match so.legacy_params(&row.op_params, row.module_version) {
        Ok(params) => {
            tracing::debug!(
                "[history] migrated {} from version {} to {} for image {}",
                so.op(),
                row.module_version,
                so.version(),
                imgid
            );
            item.params = params;
            legacy_fixups(item, module, row)
        }
        Err(e) => {
            tracing::warn!(
                "[history] module `{}' version mismatch {}: history is {}, module is {} ({})",
                so.op(),
                preset_context(row),
                row.module_version,
                so.version(),
                e
            );
            ParamsSync::Dropped
        }
    }
}

#[cfg(feature = "legacy-fixups")]
fn legacy_fixups(item: &mut HistoryItem, module: &IopModule, row: &HistoryRow) -> ParamsSync {
    match module.op() {
        // spot removal v1 predates blending
        "spots" if row.module_version == 1 => {
            item.blend_params = module.default_blend_params;
            ParamsSync::SyncedKeepBlend
        }
        // a disabled v1 flip meant "no rotation", which is the enabled default now
        "flip" if row.module_version.abs() == 1 && !row.enabled => {
            item.params.clone_from(&module.default_params);
            item.enabled = true;
            ParamsSync::Synced
        }
        _ => ParamsSync::Synced,
    }
}

#[cfg(not(feature = "legacy-fixups"))]
fn legacy_fixups(_item: &mut HistoryItem, _module: &IopModule, _row: &HistoryRow) -> ParamsSync {
    ParamsSync::Synced
}

fn sync_blendop_params(item: &mut HistoryItem, module: &IopModule, row: &HistoryRow) {
    if let Some(params) = BlendParams::from_bytes(&row.blendop_params, row.blendop_version) {
        item.blend_params = params;
        return;
    }
    item.blend_params = match BlendParams::from_legacy(&row.blendop_params, row.blendop_version) {
        Ok(params) => params,
        Err(e) => {
            if !row.blendop_params.is_empty() {
                tracing::debug!("[history] {} blend params reset to defaults: {}", module.op(), e);
            }
            module.default_blend_params
        }
    };
}
