/// State management module
///
/// This module handles everything persisted in the catalog:
/// - Database connection, schema and image rows (library.rs)
/// - History, mask, module order and preset rows (history_db.rs)
/// - Shared data structures (data.rs)
/// - Sidecar documents for stored edits (edit.rs)

pub mod data;
pub mod edit;
pub mod history_db;
pub mod library;
