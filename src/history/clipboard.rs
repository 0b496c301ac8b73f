/// History copy and paste between images

use crate::context::Context;
use crate::control::signals::Signal;
use crate::control::undo::UndoType;
use crate::develop::copy_paste::copy_and_paste_merge;
use crate::develop::history::CHANGED_TAG;
use crate::error::HistoryError;

use super::snapshot;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clipboard {
    pub source: Option<i32>,
    /// Also copy modules whose parameters are specific to the source image
    pub full_copy: bool,
    /// History item numbers picked by the user, empty for everything
    pub selected_ops: Vec<i32>,
    /// Replace the destination's module order with the source's
    pub copy_iop_order: bool,
}

impl Clipboard {
    /// Copy the whole edit of `imgid`.
    pub fn copy(&mut self, imgid: i32) {
        self.source = Some(imgid);
        self.full_copy = false;
        self.selected_ops.clear();
    }

    /// Copy only the items numbered `selected_nums`.
    pub fn copy_parts(&mut self, imgid: i32, selected_nums: &[i32]) {
        self.source = Some(imgid);
        self.full_copy = true;
        self.selected_ops = selected_nums.to_vec();
    }

    /// Paste onto every image of `imgids` but the source.
    ///
    /// # Returns
    /// * how many images received the edit
    pub fn paste_on_list(&self, ctx: &Context, imgids: &[i32], undo: bool) -> Result<usize, HistoryError> {
        let source = self.source.ok_or(HistoryError::EmptyClipboard)?;
        let ops = (!self.selected_ops.is_empty()).then_some(self.selected_ops.as_slice());

        if undo {
            ctx.undo.start_group(UndoType::LighttableHistory);
        }
        let mut pasted = 0;
        let result = imgids.iter().try_for_each(|&dest| {
            if paste_on_image(ctx, source, dest, ops, self.copy_iop_order, self.full_copy, undo)? {
                pasted += 1;
            }
            Ok::<(), HistoryError>(())
        });
        if undo {
            ctx.undo.end_group();
        }
        result?;

        ctx.signals.raise(Signal::ImageInfoChanged(imgids.to_vec()));
        Ok(pasted)
    }
}

fn paste_on_image(
    ctx: &Context,
    src: i32,
    dest: i32,
    ops: Option<&[i32]>,
    copy_iop_order: bool,
    full_copy: bool,
    undo: bool,
) -> Result<bool, HistoryError> {
    if src == dest {
        return Ok(false);
    }
    let before = if undo { Some(ctx.library.snapshot_stored_history(dest)?) } else { None };

    if copy_iop_order {
        if let Some((version, list)) = ctx.library.module_order_get(src)? {
            ctx.library.module_order_set(dest, version, &list)?;
        }
    }
    copy_and_paste_merge(ctx, src, dest, ops, full_copy)?;
    ctx.library.attach_tag(dest, CHANGED_TAG)?;

    if let Some(before) = before {
        snapshot::record(ctx, dest, before)?;
    }
    tracing::debug!("[history] pasted image {} onto image {}", src, dest);
    Ok(true)
}

/// Paste the edit of `src` (or its items `ops`) onto `dest`, undoable.
///
/// # Returns
/// * `false` when `src` and `dest` are the same image
pub fn copy_and_paste_on_image(
    ctx: &Context,
    src: i32,
    dest: i32,
    ops: Option<&[i32]>,
    copy_iop_order: bool,
    full_copy: bool,
) -> Result<bool, HistoryError> {
    paste_on_image(ctx, src, dest, ops, copy_iop_order, full_copy, true)
}
