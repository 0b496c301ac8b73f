/// Control plumbing shared by the cache, the develop state and the lighttable:
/// - Signal bus (signals.rs)
/// - Undo/redo stack (undo.rs)
/// - Background sidecar writer (jobs.rs)

pub mod jobs;
pub mod signals;
pub mod undo;
