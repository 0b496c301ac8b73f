/// Lighttable undo
///
/// Lighttable operations work on the stored edit directly, so their undo
/// records are plain copies of the stored rows before and after.

use crate::cache::image_cache::WritePolicy;
use crate::context::Context;
use crate::control::undo::{UndoAction, UndoData, UndoType};
use crate::develop::Develop;
use crate::error::HistoryError;
use crate::state::data::ImageFlags;
use crate::state::history_db::StoredHistory;

#[derive(Debug, Clone)]
pub struct LtHistoryUndo {
    pub imgid: i32,
    pub before: StoredHistory,
    pub after: StoredHistory,
}

impl LtHistoryUndo {
    /// Write the side of the record selected by `action` back to the store.
    pub fn apply(&self, ctx: &Context, action: UndoAction) -> Result<(), HistoryError> {
        let stored = match action {
            UndoAction::Undo => &self.before,
            UndoAction::Redo => &self.after,
        };
        ctx.library.restore_stored_history(self.imgid, stored)?;
        refresh_image(ctx, self.imgid, stored)?;
        tracing::debug!(
            "[lighttable undo] {:?} on image {}: {} rows, end {}",
            action,
            self.imgid,
            stored.rows.len(),
            stored.history_end
        );
        Ok(())
    }
}

/// Bring the cached record in line with a stored edit that was replaced
/// behind its back.
pub(crate) fn refresh_image(ctx: &Context, imgid: i32, stored: &StoredHistory) -> Result<(), HistoryError> {
    let mut img = ctx.image_cache.write(imgid).ok_or(HistoryError::UnknownImage(imgid))?;
    if stored.rows.is_empty() {
        img.flags.remove(ImageFlags::AUTO_PRESETS_APPLIED);
        img.history_hash = 0;
    } else {
        img.flags.insert(ImageFlags::AUTO_PRESETS_APPLIED);
    }
    img.history_items = stored.rows.len() as u32;
    img.release(WritePolicy::Safe)?;

    if !stored.rows.is_empty() {
        // recompute the history hash from the restored items
        let mut dev = Develop::new(ctx.clone());
        dev.read_history(imgid)?;
        dev.pop_history_items();
        dev.write_history()?;
    }
    Ok(())
}

/// Record the change of `imgid`'s stored edit from `before` to its current state.
pub fn record(ctx: &Context, imgid: i32, before: StoredHistory) -> Result<(), HistoryError> {
    let after = ctx.library.snapshot_stored_history(imgid)?;
    ctx.undo.record(UndoData::LighttableHistory(LtHistoryUndo { imgid, before, after }));
    Ok(())
}

fn pop(ctx: &Context, action: UndoAction) -> Result<Vec<i32>, HistoryError> {
    let mut imgids = Vec::new();
    for data in ctx.undo.pop(UndoType::LighttableHistory, action) {
        if let UndoData::LighttableHistory(undo) = data {
            undo.apply(ctx, action)?;
            if !imgids.contains(&undo.imgid) {
                imgids.push(undo.imgid);
            }
        }
    }
    Ok(imgids)
}

/// Revert the last lighttable history operation.
///
/// # Returns
/// * the images it touched
pub fn undo(ctx: &Context) -> Result<Vec<i32>, HistoryError> {
    pop(ctx, UndoAction::Undo)
}

pub fn redo(ctx: &Context) -> Result<Vec<i32>, HistoryError> {
    pop(ctx, UndoAction::Redo)
}
