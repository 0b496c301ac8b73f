/// Develop session: the live editing state of one image
///
/// - Module instances and their pipeline order (module.rs, iop_order.rs)
/// - Blending and drawn forms (blend.rs, masks.rs)
/// - The history stack and its store mapping (history.rs)
/// - Default and auto-preset history of never-edited images (defaults.rs)
/// - Undo snapshots (undo.rs)
/// - Instance list repair after undo (refresh.rs)
/// - Pipeline invalidation (pipeline.rs)
/// - Merging modules from another image (copy_paste.rs)
///
/// A [`Develop`] is owned by one thread at a time; every mutation takes
/// `&mut self`, which is what serializes history edits on an image.

pub mod blend;
pub mod copy_paste;
pub mod defaults;
pub mod history;
pub mod iop_order;
pub mod masks;
pub mod module;
pub mod pipeline;
pub mod refresh;
pub mod undo;

use crate::context::Context;
use crate::error::HistoryError;
use crate::hash::ContentHasher;
use crate::state::data::ImageRecord;

use self::history::HistoryItem;
use self::iop_order::{IopOrderList, IOP_ORDER_UNKNOWN};
use self::masks::MaskForm;
use self::module::{IopModule, ModuleId, IopFlags};
use self::pipeline::{HeadlessPipe, PipeKind};

/// Drawn-mask editing state of the focused module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskEditMode {
    #[default]
    Off,
    Full,
    Restricted,
}

/// What the darkroom overlays on the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskDisplay {
    #[default]
    None,
    Mask,
    Channel,
}

#[derive(Debug)]
pub struct Develop {
    pub(crate) ctx: Context,
    pub image_id: i32,
    /// Copy of the cached record taken at load time
    pub image: ImageRecord,

    /// Live module instances, sorted by `iop_order`
    pub iop: Vec<IopModule>,
    /// Instances dropped by undo; the pipeline may still refer to them
    pub retired: Vec<IopModule>,
    next_module_id: u32,

    pub history: Vec<HistoryItem>,
    /// Number of applied items, `0..=history.len()`
    pub history_end: usize,
    pub iop_order_list: IopOrderList,
    /// Current drawn forms
    pub forms: Vec<MaskForm>,
    pub history_hash: u64,

    /// Module focused in the darkroom
    pub gui_module: Option<ModuleId>,
    pub mask_edit_mode: MaskEditMode,
    pub mask_display: MaskDisplay,

    pub(crate) undo_depth: u32,
    pub(crate) undo_before: Option<undo::HistorySnapshot>,

    pub full_pipe: HeadlessPipe,
    pub preview_pipe: HeadlessPipe,
}

impl Develop {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            image_id: 0,
            image: ImageRecord::default(),
            iop: Vec::new(),
            retired: Vec::new(),
            next_module_id: 1,
            history: Vec::new(),
            history_end: 0,
            iop_order_list: IopOrderList::default(),
            forms: Vec::new(),
            history_hash: 0,
            gui_module: None,
            mask_edit_mode: MaskEditMode::Off,
            mask_display: MaskDisplay::None,
            undo_depth: 0,
            undo_before: None,
            full_pipe: HeadlessPipe::new(PipeKind::Full),
            preview_pipe: HeadlessPipe::new(PipeKind::Preview),
        }
    }

    /// Open `imgid` for editing: read its history, apply it and build the pipes.
    pub fn load(ctx: Context, imgid: i32) -> Result<Self, HistoryError> {
        let mut dev = Self::new(ctx);
        let first_run = dev.read_history(imgid)?;
        dev.pop_history_items();
        if first_run {
            // the defaults were materialized by this load, store them with the order list
            dev.write_history()?;
        }
        dev.pipeline_rebuild_all();
        tracing::debug!(
            "[develop] loaded image {}: {} history items, end {}",
            imgid,
            dev.history.len(),
            dev.history_end
        );
        Ok(dev)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn alloc_module_id(&mut self) -> ModuleId {
        let id = ModuleId(self.next_module_id);
        self.next_module_id += 1;
        id
    }

    /// Instantiate every registered module once, at multi-priority 0.
    pub(crate) fn load_modules(&mut self) {
        if !self.iop.is_empty() {
            return;
        }
        let registry = std::sync::Arc::clone(&self.ctx.registry);
        for so in registry.iter() {
            let id = self.alloc_module_id();
            let mut module = IopModule::new(id, std::sync::Arc::clone(so));
            module.iop_order = self.iop_order_list.get(module.op(), 0);
            self.iop.push(module);
        }
        self.sort_iop();
    }

    /// Refresh the local copy of the image record from the cache.
    pub(crate) fn load_image(&mut self, imgid: i32) -> Result<(), HistoryError> {
        let img = self.ctx.image_cache.read(imgid).ok_or(HistoryError::UnknownImage(imgid))?;
        self.image = (*img).clone();
        self.image_id = imgid;
        Ok(())
    }

    pub fn module(&self, id: ModuleId) -> Option<&IopModule> {
        self.iop.iter().find(|m| m.id == id)
    }

    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut IopModule> {
        self.iop.iter_mut().find(|m| m.id == id)
    }

    pub(crate) fn module_index(&self, id: ModuleId) -> Option<usize> {
        self.iop.iter().position(|m| m.id == id)
    }

    /// Instance `multi_priority` of `op`
    pub fn find_module(&self, op: &str, multi_priority: i32) -> Option<&IopModule> {
        self.iop.iter().find(|m| m.op() == op && m.multi_priority == multi_priority)
    }

    /// Lowest-priority live instance of `op`
    pub fn base_module(&self, op: &str) -> Option<&IopModule> {
        self.iop.iter().filter(|m| m.op() == op).min_by_key(|m| m.multi_priority)
    }

    pub fn history_end(&self) -> usize {
        self.history_end
    }

    /// Move the cursor, clamped to the stack.
    pub fn set_history_end(&mut self, end: usize) {
        self.history_end = end.min(self.history.len());
    }

    /// Fold of the applied items' hashes, newest first
    pub fn get_hash(&self) -> u64 {
        let mut h = ContentHasher::new();
        for item in self.history[..self.history_end].iter().rev() {
            h.u64(item.hash);
        }
        h.finish()
    }

    pub(crate) fn sort_iop(&mut self) {
        self.iop.sort_by_key(|m| (m.iop_order, m.multi_priority));
    }

    /// Give every instance its position from the order list, listing the
    /// instances it does not know yet, and keep history items in step.
    pub(crate) fn resync_modules_order(&mut self) {
        for module in &self.iop {
            if !self.iop_order_list.contains(module.op(), module.multi_priority) {
                self.iop_order_list.insert_instance(module.op(), module.multi_priority);
            }
        }
        for module in &mut self.iop {
            module.iop_order = self.iop_order_list.get(module.op(), module.multi_priority);
        }
        for item in &mut self.history {
            let order = self.iop_order_list.get(&item.op_name, item.multi_priority);
            if order != IOP_ORDER_UNKNOWN {
                item.iop_order = order;
            }
        }
        self.sort_iop();
    }

    /// Log instances sharing a position. `true` when the order is sound.
    pub(crate) fn check_iop_order(&mut self, context: &str) -> bool {
        if self.iop_order_list.check_duplicates() {
            self.resync_modules_order();
        }
        let mut sound = true;
        for pair in self.iop.windows(2) {
            if pair[0].iop_order == pair[1].iop_order {
                tracing::error!(
                    "[{}] modules {}({}) and {}({}) share iop_order {}",
                    context,
                    pair[0].op(),
                    pair[0].multi_priority,
                    pair[1].op(),
                    pair[1].multi_priority,
                    pair[0].iop_order
                );
                sound = false;
            }
        }
        sound
    }

    /// Add an instance of `base`'s module right after its last instance.
    ///
    /// # Returns
    /// * the new instance, `None` for single-instance modules
    pub fn duplicate_module(&mut self, base: ModuleId) -> Option<ModuleId> {
        let source = self.module(base)?;
        if source.flags().contains(IopFlags::ONE_INSTANCE) {
            tracing::debug!("[develop] {} does not allow more instances", source.op());
            return None;
        }
        let op = source.op();
        let multi_priority = self
            .iop
            .iter()
            .chain(self.retired.iter())
            .filter(|m| m.op() == op)
            .map(|m| m.multi_priority)
            .max()
            .unwrap_or(0)
            + 1;

        let id = self.alloc_module_id();
        let source = self.module(base)?;
        let mut module = source.duplicate_as(id, multi_priority);
        module.iop_order = self.iop_order_list.insert_instance(op, multi_priority);
        module.compute_hash(&self.forms);
        self.iop.push(module);
        self.resync_modules_order();
        self.pipeline_rebuild_all();
        tracing::debug!("[develop] new instance {}({}) on image {}", op, multi_priority, self.image_id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixture;

    #[test]
    fn test_load_modules_once_in_pipeline_order() {
        let ctx = fixture::context();
        let mut dev = Develop::new(ctx);
        dev.load_modules();
        let count = dev.iop.len();
        dev.load_modules();
        assert_eq!(dev.iop.len(), count);
        let ops: Vec<&str> = dev.iop.iter().map(|m| m.op()).collect();
        assert_eq!(ops, iop_order::PIPELINE_ORDER.to_vec());
        assert!(dev.check_iop_order("test"));
    }

    #[test]
    fn test_cursor_is_clamped() {
        let ctx = fixture::context();
        let imgid = fixture::add_raw(&ctx);
        let mut dev = Develop::load(ctx, imgid).unwrap();
        let len = dev.history.len();
        dev.set_history_end(len + 10);
        assert_eq!(dev.history_end(), len);
        dev.set_history_end(0);
        assert_eq!(dev.get_hash(), ContentHasher::new().finish());
    }

    #[test]
    fn test_duplicate_module() {
        let ctx = fixture::context();
        let imgid = fixture::add_raw(&ctx);
        let mut dev = Develop::load(ctx, imgid).unwrap();

        let exposure = dev.find_module("exposure", 0).unwrap().id;
        let copy = dev.duplicate_module(exposure).unwrap();
        let module = dev.module(copy).unwrap();
        assert_eq!(module.multi_priority, 1);
        assert_eq!(module.op(), "exposure");
        let base_order = dev.module(exposure).unwrap().iop_order;
        assert_eq!(dev.module(copy).unwrap().iop_order, base_order + 1);
        assert!(dev.check_iop_order("test"));

        let flip = dev.find_module("flip", 0).unwrap().id;
        assert!(dev.duplicate_module(flip).is_none());
    }
}
