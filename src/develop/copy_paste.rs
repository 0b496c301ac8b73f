/// Merging modules of one image into another
///
/// Both sides are read into private sessions, never the darkroom's. Each
/// transferred module lands in a destination instance with its parameters,
/// blending and the drawn forms it references, then becomes a new history
/// item of the destination.

use super::masks::{self, MaskForm};
use super::module::{skip_copy, IopFlags, IopModule, ModuleId};
use super::Develop;
use crate::context::Context;
use crate::error::HistoryError;

impl Develop {
    /// Copy the state of `src` into an instance of this session.
    ///
    /// # Returns
    /// * the destination instance, `None` when the module is unknown here
    pub fn merge_module(&mut self, src: &IopModule, src_forms: &[MaskForm]) -> Option<ModuleId> {
        let op = src.op();
        let id = if src.flags().contains(IopFlags::ONE_INSTANCE) {
            self.base_module(op)?.id
        } else {
            match self.unused_instance(op) {
                Some(id) => id,
                None => self.new_instance_for(op, src.multi_priority)?,
            }
        };

        let mut copied_forms: Vec<u32> = Vec::new();
        if src.flags().contains(IopFlags::SUPPORTS_BLENDING) && src.blend_params.mask_id > 0 {
            copied_forms.extend(masks::used_forms(src_forms, src.blend_params.mask_id));
        }
        for root in src.so.used_forms(&src.params) {
            copied_forms.extend(masks::used_forms(src_forms, root));
        }
        for formid in &copied_forms {
            match masks::get_from_id(src_forms, *formid) {
                Some(form) => masks::replace_or_append(&mut self.forms, form.clone()),
                None => tracing::debug!("[paste] form {} of {} not found in the source", formid, op),
            }
        }

        let midx = self.module_index(id)?;
        let module = &mut self.iop[midx];
        module.enabled = src.enabled;
        module.multi_name.clone_from(&src.multi_name);
        if module.params.len() == src.params.len() {
            module.params.clone_from(&src.params);
        }
        if module.flags().contains(IopFlags::SUPPORTS_BLENDING) {
            module.blend_params = src.blend_params;
        }
        module.compute_hash(&self.forms);
        tracing::debug!(
            "[paste] {}({}) merged into {:?} of image {}",
            op,
            src.multi_priority,
            id,
            self.image_id
        );

        self.sort_iop();
        self.add_history_item_ext(Some(id), false, true, true);
        if !copied_forms.is_empty() {
            self.add_history_item_ext(None, false, true, true);
        }
        self.resync_modules_order();
        self.pop_history_items();
        Some(id)
    }

    /// Instance of `op` no history item refers to, lowest priority first
    fn unused_instance(&self, op: &str) -> Option<ModuleId> {
        if self.history.iter().any(|h| h.op_name == op) {
            return None;
        }
        self.iop
            .iter()
            .filter(|m| m.op() == op && !self.history.iter().any(|h| h.module == Some(m.id)))
            .min_by_key(|m| m.multi_priority)
            .map(|m| m.id)
    }

    /// New instance of `op`, at `multi_priority` if it is free.
    fn new_instance_for(&mut self, op: &str, multi_priority: i32) -> Option<ModuleId> {
        self.base_module(op)?;
        let taken = self
            .iop
            .iter()
            .chain(self.retired.iter())
            .any(|m| m.op() == op && m.multi_priority == multi_priority);
        let multi_priority = if taken {
            self.iop
                .iter()
                .chain(self.retired.iter())
                .filter(|m| m.op() == op)
                .map(|m| m.multi_priority)
                .max()
                .unwrap_or(0)
                + 1
        } else {
            multi_priority
        };
        let id = self.alloc_module_id();
        let base = self.base_module(op)?;
        let mut module = base.duplicate_as(id, multi_priority);
        module.iop_order = self.iop_order_list.insert_instance(op, multi_priority);
        self.iop.push(module);
        Some(id)
    }

    /// Merge the instances `ids` of `src`, then store the result.
    pub fn merge_list(&mut self, src: &Develop, ids: &[ModuleId]) -> Result<(), HistoryError> {
        for id in ids {
            let Some(module) = src.module(*id) else {
                continue;
            };
            if self.merge_module(module, &src.forms).is_none() {
                tracing::warn!("[paste] module `{}' cannot be pasted on image {}", module.op(), self.image_id);
            }
        }
        self.resync_modules_order();
        self.check_iop_order("merge_list");
        self.write_history()
    }
}

/// Instances of `src` worth transferring: those named by the item numbers in
/// `ops`, or else every one with history, minus image-specific modules
/// unless `full_copy`.
fn modules_to_copy(src: &Develop, ops: Option<&[i32]>, full_copy: bool) -> Vec<ModuleId> {
    let mut ids: Vec<ModuleId> = Vec::new();
    match ops {
        Some(nums) => {
            for num in nums {
                let Some(id) = src.history.iter().find(|h| h.num == *num).and_then(|h| h.module) else {
                    tracing::debug!("[paste] no item {} in the source history", num);
                    continue;
                };
                if src.module(id).is_some_and(|m| !m.is_hidden()) && !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        None => {
            for module in &src.iop {
                let has_history = src.history[..src.history_end].iter().any(|h| h.module == Some(module.id));
                let copyable = full_copy || !skip_copy(module.flags());
                if has_history && copyable && !module.is_hidden() && !ids.contains(&module.id) {
                    ids.push(module.id);
                }
            }
        }
    }
    ids
}

/// Merge the history of `src` into `dest`, through private sessions.
pub fn copy_and_paste_merge(
    ctx: &Context,
    src: i32,
    dest: i32,
    ops: Option<&[i32]>,
    full_copy: bool,
) -> Result<(), HistoryError> {
    let mut src_dev = Develop::new(ctx.clone());
    src_dev.read_history(src)?;
    src_dev.pop_history_items();

    let mut dest_dev = Develop::new(ctx.clone());
    dest_dev.read_history(dest)?;
    dest_dev.pop_history_items();

    let ids = modules_to_copy(&src_dev, ops, full_copy);
    tracing::debug!("[paste] {} modules from image {} to image {}", ids.len(), src, dest);
    dest_dev.merge_list(&src_dev, &ids)
}
