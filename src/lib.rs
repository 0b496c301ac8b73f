/// Non-destructive edit history and image metadata cache of the RAW editor
///
/// - Catalog store: images, history, masks, module order, presets (state/)
/// - Image metadata cache with write-through leases (cache/)
/// - Signals, undo stack and the sidecar worker (control/)
/// - Develop sessions: the history engine of one open image (develop/)
/// - Built-in processing modules (iop/)
/// - Lighttable history operations on stored edits (history/)

pub mod cache;
pub mod color;
pub mod config;
pub mod context;
pub mod control;
pub mod develop;
pub mod error;
pub mod hash;
pub mod history;
pub mod iop;
pub mod state;

pub use context::Context;
pub use develop::Develop;
pub use error::{CacheError, HistoryError, MigrationError, StoreError};
