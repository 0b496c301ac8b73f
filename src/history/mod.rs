/// Lighttable history operations
///
/// These act on the stored edit of images that are not open in the
/// darkroom: delete, compress, truncate, copy and paste, sidecar import and
/// export. Each one reads a private develop session when it needs one and
/// records lighttable undo entries of the stored rows.
///
/// - Copy and paste between images (clipboard.rs)
/// - Lighttable undo records (snapshot.rs)

pub mod clipboard;
pub mod snapshot;

use std::path::{Path, PathBuf};

use crate::cache::image_cache::WritePolicy;
use crate::context::Context;
use crate::control::signals::Signal;
use crate::control::undo::UndoType;
use crate::develop::history::CHANGED_TAG;
use crate::develop::Develop;
use crate::error::{HistoryError, StoreError};
use crate::state::data::ImageFlags;
use crate::state::edit::SidecarDocument;
use crate::state::history_db::HistorySummary;

/// Tags left behind by applied styles
pub const STYLE_TAGS: &str = "darktable|style|%";

/// Where the history cursor of an image sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// No history at all
    Reset,
    /// Every item is applied
    AtTop,
    /// Some items past the cursor
    MidStack,
}

fn delete_on_image_ext(ctx: &Context, imgid: i32, undo: bool) -> Result<(), HistoryError> {
    let before = if undo { Some(ctx.library.snapshot_stored_history(imgid)?) } else { None };

    ctx.library.history_delete(imgid)?;

    let mut img = ctx.image_cache.write(imgid).ok_or(HistoryError::UnknownImage(imgid))?;
    img.flags.remove(ImageFlags::AUTO_PRESETS_APPLIED);
    img.history_hash = 0;
    img.history_items = 0;
    img.release(WritePolicy::Safe)?;

    let detached = ctx.library.detach_tags_like(imgid, STYLE_TAGS)? + ctx.library.detach_tags_like(imgid, CHANGED_TAG)?;
    tracing::debug!("[history] deleted history of image {}, {} tags detached", imgid, detached);

    if let Some(before) = before {
        snapshot::record(ctx, imgid, before)?;
    }
    Ok(())
}

/// Remove the whole edit of `imgid`.
pub fn delete_on_image(ctx: &Context, imgid: i32, undo: bool) -> Result<(), HistoryError> {
    delete_on_image_ext(ctx, imgid, undo)?;
    ctx.signals.raise(Signal::TagChanged);
    Ok(())
}

/// Remove the edits of `imgids`, undoable in one step.
pub fn delete_on_list(ctx: &Context, imgids: &[i32], undo: bool) -> Result<(), HistoryError> {
    if undo {
        ctx.undo.start_group(UndoType::LighttableHistory);
    }
    let result = imgids.iter().try_for_each(|&imgid| delete_on_image_ext(ctx, imgid, undo));
    if undo {
        ctx.undo.end_group();
    }
    result?;

    ctx.signals.raise(Signal::TagChanged);
    ctx.signals.raise(Signal::ImageInfoChanged(imgids.to_vec()));
    Ok(())
}

/// Compress the stored history of `imgid` up to its cursor.
pub fn compress_on_image(ctx: &Context, imgid: i32) -> Result<(), HistoryError> {
    let end = ctx.library.history_get_end(imgid)?;
    if end == 0 {
        return delete_on_image(ctx, imgid, false);
    }

    let mut dev = Develop::new(ctx.clone());
    dev.read_history(imgid)?;
    dev.set_history_end(end as usize);
    dev.pop_history_items();
    dev.compress_history()?;
    dev.notify_change();
    Ok(())
}

pub fn end_attop(ctx: &Context, imgid: i32) -> Result<CursorPosition, HistoryError> {
    let end = ctx.library.history_get_end(imgid)?;
    let Some(max_num) = ctx.library.history_max_num(imgid)? else {
        return Ok(if end == 0 { CursorPosition::Reset } else { CursorPosition::AtTop });
    };
    Ok(if end > max_num { CursorPosition::AtTop } else { CursorPosition::MidStack })
}

/// Compress every image of `imgids` whose cursor is at the top.
///
/// # Returns
/// * how many images were left alone because their cursor sits mid-stack
pub fn compress_on_list(ctx: &Context, imgids: &[i32]) -> Result<usize, HistoryError> {
    let mut uncompressed = 0;
    for &imgid in imgids {
        match end_attop(ctx, imgid)? {
            CursorPosition::AtTop => compress_on_image(ctx, imgid)?,
            CursorPosition::MidStack => {
                tracing::info!("[history] image {} not compressed, its history is not at the top", imgid);
                uncompressed += 1;
            }
            CursorPosition::Reset => {}
        }
    }
    Ok(uncompressed)
}

/// Drop the stored items at or past `end`. An end of 0 deletes the history.
pub fn truncate_on_image(ctx: &Context, imgid: i32, end: i32) -> Result<(), HistoryError> {
    if end <= 0 {
        return delete_on_image(ctx, imgid, false);
    }
    let mut dev = Develop::new(ctx.clone());
    dev.read_history(imgid)?;
    dev.set_history_end(end as usize);
    dev.pop_history_items();
    dev.truncate_history(dev.history_end())?;
    dev.notify_change();
    Ok(())
}

/// Mark the thumbnail as rendered from the current history.
pub fn hash_set_mipmap(ctx: &Context, imgid: i32) -> Result<(), HistoryError> {
    let mut img = ctx.image_cache.write(imgid).ok_or(HistoryError::UnknownImage(imgid))?;
    img.mipmap_hash = img.history_hash;
    img.release(WritePolicy::Relaxed)?;
    Ok(())
}

/// Latest state of each module instance, newest first
pub fn items(ctx: &Context, imgid: i32, enabled_only: bool) -> Result<Vec<HistorySummary>, HistoryError> {
    Ok(ctx.library.history_items(imgid, enabled_only)?)
}

/// One line per stored item, newest first: `●` for enabled, `○` for disabled.
pub fn items_as_string(ctx: &Context, imgid: i32) -> Result<String, HistoryError> {
    let lines: Vec<String> = ctx
        .library
        .history_rows_newest_first(imgid)?
        .into_iter()
        .map(|item| {
            let name = ctx.registry.get(&item.operation).map_or(item.operation.as_str(), |so| so.name());
            let mark = if item.enabled { '●' } else { '○' };
            let instance = item.multi_name.trim();
            if instance.is_empty() || instance == "0" {
                format!("{mark}  {name}")
            } else {
                format!("{mark}  {name} {instance}")
            }
        })
        .collect();
    Ok(lines.join("\n"))
}

/// Replace the stored edit of `imgid` with the one in the sidecar at `path`.
pub fn load_and_apply(ctx: &Context, imgid: i32, path: &Path) -> Result<(), HistoryError> {
    let doc = SidecarDocument::read_from(path)?;
    let before = ctx.library.snapshot_stored_history(imgid)?;

    ctx.undo.start_group(UndoType::LighttableHistory);
    let result = (|| {
        doc.apply(&ctx.library, imgid)?;
        snapshot::refresh_image(ctx, imgid, &doc.to_stored(imgid))?;
        snapshot::record(ctx, imgid, before)
    })();
    ctx.undo.end_group();
    result?;

    tracing::info!("[history] applied {} to image {}", path.display(), imgid);
    ctx.signals.raise(Signal::ImageInfoChanged(vec![imgid]));
    Ok(())
}

/// Write the sidecar of `imgid` next to its file.
///
/// # Returns
/// * the path written
pub fn export_sidecar(ctx: &Context, imgid: i32) -> Result<PathBuf, HistoryError> {
    let doc = SidecarDocument::collect(&ctx.library, imgid)?.ok_or(HistoryError::UnknownImage(imgid))?;
    let img = ctx.image_cache.read(imgid).ok_or(HistoryError::UnknownImage(imgid))?;
    let path = SidecarDocument::path_for(Path::new(&img.fullpath));
    drop(img);

    let json = doc.to_json().map_err(StoreError::from)?;
    std::fs::write(&path, json).map_err(StoreError::from)?;
    ctx.signals.raise(Signal::ImageExportTmpfile { imgid, path: path.clone() });
    Ok(path)
}
