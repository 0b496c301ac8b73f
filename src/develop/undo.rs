/// Darkroom undo
///
/// A transaction is the pair of snapshots taken around a history change.
/// Transactions nest: only the outermost start and end take snapshots, so
/// an edit built from several appends undoes in one step.

use super::history::{history_duplicate, HistoryItem};
use super::iop_order::IopOrderList;
use super::module::ModuleId;
use super::{Develop, MaskDisplay, MaskEditMode};
use crate::control::signals::Signal;
use crate::control::undo::{UndoAction, UndoData, UndoType};
use crate::error::HistoryError;

#[derive(Debug, Clone, PartialEq)]
pub struct HistorySnapshot {
    pub items: Vec<HistoryItem>,
    pub history_end: usize,
    pub iop_order_list: IopOrderList,
}

#[derive(Debug, Clone)]
pub struct HistoryUndo {
    pub imgid: i32,
    pub before: HistorySnapshot,
    pub after: HistorySnapshot,
    pub mask_edit_mode: MaskEditMode,
    pub mask_display: MaskDisplay,
}

impl HistoryUndo {
    fn snapshots_mut(&mut self) -> [&mut HistorySnapshot; 2] {
        [&mut self.before, &mut self.after]
    }

    /// Point items of `(op, multi_priority)` at the instance `id`.
    pub fn reset_module_instance(&mut self, op: &str, multi_priority: i32, id: ModuleId) {
        for snapshot in self.snapshots_mut() {
            for item in snapshot.items.iter_mut().filter(|h| h.op_name == op && h.multi_priority == multi_priority) {
                item.module = Some(id);
            }
        }
    }

    /// Forget the instance `id`; items resolve it again by operation when applied.
    pub fn invalidate_module(&mut self, id: ModuleId) {
        for snapshot in self.snapshots_mut() {
            for item in snapshot.items.iter_mut().filter(|h| h.module == Some(id)) {
                item.module = None;
            }
        }
    }
}

impl Develop {
    fn history_snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            items: history_duplicate(&self.history),
            history_end: self.history_end,
            iop_order_list: self.iop_order_list.clone(),
        }
    }

    /// Open a transaction. Only the outermost call takes the "before" snapshot.
    pub fn undo_start_record(&mut self) {
        if self.undo_depth == 0 {
            self.undo_before = Some(self.history_snapshot());
        }
        self.undo_depth += 1;
    }

    /// Close a transaction. The outermost call records it.
    pub fn undo_end_record(&mut self) {
        if self.undo_depth == 0 {
            tracing::warn!("[undo] end of a transaction that was never started");
            return;
        }
        self.undo_depth -= 1;
        if self.undo_depth > 0 {
            return;
        }
        let Some(before) = self.undo_before.take() else {
            return;
        };
        let (mask_edit_mode, mask_display) = self.mask_modes();
        self.ctx.undo.record(UndoData::History(HistoryUndo {
            imgid: self.image_id,
            before,
            after: self.history_snapshot(),
            mask_edit_mode,
            mask_display,
        }));
        self.ctx.signals.raise(Signal::HistoryChange(self.image_id));
    }

    fn mask_modes(&self) -> (MaskEditMode, MaskDisplay) {
        match self.gui_module {
            Some(_) => (self.mask_edit_mode, self.mask_display),
            None => (MaskEditMode::Off, MaskDisplay::None),
        }
    }

    /// Revert the last darkroom transaction of this image.
    ///
    /// # Returns
    /// * `false` when there was nothing to undo for this image
    pub fn undo(&mut self) -> Result<bool, HistoryError> {
        self.undo_pop(UndoAction::Undo)
    }

    pub fn redo(&mut self) -> Result<bool, HistoryError> {
        self.undo_pop(UndoAction::Redo)
    }

    fn undo_pop(&mut self, action: UndoAction) -> Result<bool, HistoryError> {
        let mut applied = false;
        for data in self.ctx.undo.pop(UndoType::History, action) {
            match data {
                UndoData::History(undo) if undo.imgid == self.image_id => {
                    self.apply_undo(undo, action)?;
                    applied = true;
                }
                UndoData::History(undo) => {
                    tracing::debug!("[undo] record of image {} skipped on image {}", undo.imgid, self.image_id);
                }
                UndoData::LighttableHistory(_) => {}
            }
        }
        Ok(applied)
    }

    fn apply_undo(&mut self, undo: HistoryUndo, action: UndoAction) -> Result<(), HistoryError> {
        let snapshot = match action {
            UndoAction::Undo => undo.before,
            UndoAction::Redo => undo.after,
        };
        self.pipes_shutdown();

        let references: Vec<(String, i32, Option<ModuleId>)> =
            snapshot.items.iter().map(|h| (h.op_name.clone(), h.multi_priority, h.module)).collect();
        self.history = snapshot.items;
        self.history_end = snapshot.history_end.min(self.history.len());
        self.iop_order_list = snapshot.iop_order_list;

        self.write_history()?;
        self.reload_history_items()?;

        let recreated: Vec<(String, i32, ModuleId)> = self
            .history
            .iter()
            .filter_map(|h| Some((h.op_name.clone(), h.multi_priority, h.module?)))
            .filter(|(op, prio, id)| {
                references.iter().any(|(o, p, old)| o == op && p == prio && *old != Some(*id))
            })
            .collect();
        for (op, multi_priority, id) in recreated {
            self.history_undo_reset_module(&op, multi_priority, id);
        }

        if self.refresh_nodes() {
            self.ctx.library.module_order_set(
                self.image_id,
                self.iop_order_list.version,
                &self.iop_order_list.serialize(),
            )?;
            self.pipeline_rebuild_all();
        } else {
            self.pipeline_resync_history_all();
        }
        self.notify_change();

        if self.gui_module.is_some() {
            self.mask_edit_mode = undo.mask_edit_mode;
            self.mask_display = undo.mask_display;
        }
        tracing::debug!(
            "[undo] {:?} on image {}: {} items, end {}",
            action,
            self.image_id,
            self.history.len(),
            self.history_end
        );
        self.ctx.signals.raise(Signal::HistoryChange(self.image_id));
        Ok(())
    }

    /// Drop every reference to the instance `id` from recorded transactions.
    pub fn history_undo_invalidate_module(&self, id: ModuleId) {
        self.ctx.undo.iterate_mut(UndoType::History, |data| {
            if let UndoData::History(undo) = data {
                undo.invalidate_module(id);
            }
        });
    }

    /// Point recorded transactions of this image at a recreated instance.
    pub(crate) fn history_undo_reset_module(&self, op: &str, multi_priority: i32, id: ModuleId) {
        let imgid = self.image_id;
        self.ctx.undo.iterate_mut(UndoType::History, |data| {
            if let UndoData::History(undo) = data {
                if undo.imgid == imgid {
                    undo.reset_module_instance(op, multi_priority, id);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixture;
    use crate::control::signals::SignalKind;
    use crate::iop::correct::ExposureParams;
    use crate::iop::decode;
    use crate::state::data::ImageFlags;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Item state that survives instances being recreated
    fn shape(dev: &Develop) -> Vec<(String, i32, bool, Vec<u8>)> {
        dev.history
            .iter()
            .map(|h| (h.op_name.clone(), h.multi_priority, h.enabled, h.params.clone()))
            .collect()
    }

    fn set_exposure(dev: &mut Develop, id: ModuleId, exposure: f32) {
        let module = dev.module_mut(id).unwrap();
        let mut params: ExposureParams = decode(&module.params).unwrap();
        params.exposure = exposure;
        module.params = bytemuck::bytes_of(&params).to_vec();
        dev.add_history_item(id, true).unwrap();
    }

    #[test]
    fn test_undo_redo_roundtrip() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "u.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx.clone(), imgid).unwrap();
        let exposure = dev.find_module("exposure", 0).unwrap().id;

        set_exposure(&mut dev, exposure, 0.7);
        let edited = shape(&dev);
        let edited_end = dev.history_end;
        let edited_list = dev.iop_order_list.clone();

        assert!(dev.undo().unwrap());
        assert_eq!(dev.history.len(), 3);
        assert!(!dev.find_module("exposure", 0).unwrap().enabled);
        assert_eq!(ctx.library.history_get_end(imgid).unwrap(), 3);

        assert!(dev.redo().unwrap());
        assert_eq!(shape(&dev), edited);
        assert_eq!(dev.history_end, edited_end);
        assert_eq!(dev.iop_order_list, edited_list);
        let params: ExposureParams = decode(&dev.find_module("exposure", 0).unwrap().params).unwrap();
        assert_eq!(params.exposure, 0.7);

        assert!(!dev.redo().unwrap());
    }

    #[test]
    fn test_nested_records_make_one_transaction() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "n.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx.clone(), imgid).unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&changes);
        ctx.signals.connect(SignalKind::HistoryChange, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let exposure = dev.find_module("exposure", 0).unwrap().id;
        let colorin = dev.find_module("colorin", 0).unwrap().id;
        dev.undo_start_record();
        set_exposure(&mut dev, exposure, 1.0);
        dev.add_history_item(colorin, true).unwrap();
        dev.undo_end_record();

        assert_eq!(ctx.undo.len(UndoType::History), 1);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(dev.history.len(), 5);

        dev.undo().unwrap();
        assert_eq!(dev.history.len(), 3);
    }

    #[test]
    fn test_undo_restores_cursor() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "k.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx, imgid).unwrap();
        let exposure = dev.find_module("exposure", 0).unwrap().id;
        set_exposure(&mut dev, exposure, 0.3);
        set_exposure(&mut dev, exposure, 0.4);

        dev.set_history_end(2);
        dev.pop_history_items();
        let colorout = dev.find_module("colorout", 0).unwrap().id;
        dev.add_history_item(colorout, true).unwrap();
        assert_eq!(dev.history.len(), 3);

        dev.undo().unwrap();
        assert_eq!(dev.history_end, 2);
        assert_eq!(dev.history.len(), 4);
    }

    #[test]
    fn test_undo_across_module_add() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "m.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx.clone(), imgid).unwrap();
        let end = dev.history_end;

        let base = dev.find_module("exposure", 0).unwrap().id;
        let copy = dev.duplicate_module(base).unwrap();
        set_exposure(&mut dev, copy, 2.0);
        assert!(dev.history.iter().any(|h| h.module == Some(copy)));

        dev.undo().unwrap();
        assert_eq!(dev.history_end, end);
        assert!(dev.history.iter().all(|h| h.module != Some(copy)));
        assert!(dev.module(copy).is_none());
        assert!(dev.retired.iter().any(|m| m.id == copy));
        assert!(!dev.iop_order_list.contains("exposure", 1));
        assert!(dev.full_pipe.nodes().iter().all(|n| n.module != copy));

        // redo brings a fresh instance back at the same priority
        dev.redo().unwrap();
        let again = dev.find_module("exposure", 1).unwrap();
        assert_ne!(again.id, copy);
        let params: ExposureParams = decode(&again.params).unwrap();
        assert_eq!(params.exposure, 2.0);
        assert!(dev.check_iop_order("test"));
    }

    #[test]
    fn test_invalidate_module_clears_snapshots() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "i.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx.clone(), imgid).unwrap();
        let exposure = dev.find_module("exposure", 0).unwrap().id;
        set_exposure(&mut dev, exposure, 0.1);

        dev.history_undo_invalidate_module(exposure);
        let mut referenced = false;
        ctx.undo.iterate_mut(UndoType::History, |data| {
            if let UndoData::History(undo) = data {
                referenced |= undo.after.items.iter().any(|h| h.module == Some(exposure));
            }
        });
        assert!(!referenced);
    }

    #[test]
    fn test_mask_modes_come_back_with_focus() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "f.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx, imgid).unwrap();
        let exposure = dev.find_module("exposure", 0).unwrap().id;

        dev.gui_module = Some(exposure);
        dev.mask_edit_mode = MaskEditMode::Full;
        dev.mask_display = MaskDisplay::Mask;
        set_exposure(&mut dev, exposure, 0.2);

        dev.mask_edit_mode = MaskEditMode::Off;
        dev.mask_display = MaskDisplay::None;
        dev.undo().unwrap();
        assert_eq!(dev.mask_edit_mode, MaskEditMode::Full);
        assert_eq!(dev.mask_display, MaskDisplay::Mask);
    }
}
