/// Image metadata cache
///
/// Mirrors `images` rows in memory behind read/write leases. Write leases
/// are committed with a [`WritePolicy`]; every release recomputes the
/// record's self hash to catch mutation that would otherwise never reach
/// the catalog.

use parking_lot::lock_api::ArcRwLockWriteGuard;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock, Weak};

use super::{Cache, ReadLease, SeedOutcome, WriteLease};
use crate::control::jobs::SidecarWriter;
use crate::control::signals::{Signal, SignalBus, SignalKind};
use crate::error::CacheError;
use crate::state::data::ImageRecord;
use crate::state::library::Library;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    Read,
    Write,
}

/// What a write lease does on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Release only. The record must not have changed.
    Minimal,
    /// Write through to the catalog
    Relaxed,
    /// Write through, then queue a sidecar write
    Safe,
}

pub struct ImageCache {
    cache: Cache<ImageRecord>,
    library: Arc<Library>,
    sidecar: OnceLock<SidecarWriter>,
    write_sidecar_files: bool,
}

/// Approximate memory held by one record
fn record_cost(img: &ImageRecord) -> usize {
    std::mem::size_of::<ImageRecord>()
        + img.filename.len()
        + img.folder.len()
        + img.fullpath.len()
        + img.local_copy_path.len()
        + img.local_copy_legacy_path.len()
        + img.exif.maker.len()
        + img.exif.model.len()
        + img.exif.lens.len()
        + img.filmroll.len()
        + img.datetime.len()
}

impl ImageCache {
    pub fn new(library: Arc<Library>, quota: usize, write_sidecar_files: bool) -> Self {
        Self {
            cache: Cache::new(quota),
            library,
            sidecar: OnceLock::new(),
            write_sidecar_files,
        }
    }

    /// Safe releases enqueue sidecar writes here once set.
    pub fn set_sidecar_writer(&self, writer: SidecarWriter) {
        if self.sidecar.set(writer).is_err() {
            tracing::warn!("[image_cache] sidecar writer already set");
        }
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    fn load(&self, imgid: i32) -> Result<Option<(ImageRecord, usize)>, CacheError> {
        let record = self.library.load_image(imgid)?;
        if record.is_none() {
            tracing::debug!("[image_cache] image {} not found in the catalog", imgid);
        }
        Ok(record.map(|img| {
            let cost = record_cost(&img);
            (img, cost)
        }))
    }

    fn entry(&self, imgid: i32) -> Option<Arc<parking_lot::RwLock<ImageRecord>>> {
        if imgid <= 0 {
            return None;
        }
        match self.cache.get_or_load(imgid, || self.load(imgid)) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!("[image_cache] failed to load image {}: {}", imgid, e);
                None
            }
        }
    }

    /// Lease an image, blocking until the mode is available.
    /// `None` when the image is not in the catalog or its row is unreadable.
    pub fn get(&self, imgid: i32, mode: LeaseMode) -> Option<ImageLease<'_>> {
        let entry = self.entry(imgid)?;
        Some(match mode {
            LeaseMode::Read => ImageLease::Read(ImageReadGuard::new(entry.read_arc())),
            LeaseMode::Write => ImageLease::Write(ImageWriteGuard::new(self, entry.write_arc())),
        })
    }

    pub fn read(&self, imgid: i32) -> Option<ImageReadGuard> {
        let entry = self.entry(imgid)?;
        Some(ImageReadGuard::new(entry.read_arc()))
    }

    pub fn write(&self, imgid: i32) -> Option<ImageWriteGuard<'_>> {
        let entry = self.entry(imgid)?;
        Some(ImageWriteGuard::new(self, entry.write_arc()))
    }

    /// Never blocks: `None` if the cache or the entry is busy.
    pub fn try_get(&self, imgid: i32, mode: LeaseMode) -> Option<ImageLease<'_>> {
        if imgid <= 0 {
            return None;
        }
        let entry = match self.cache.try_get_or_load(imgid, || self.load(imgid)) {
            Ok(entry) => entry?,
            Err(e) => {
                tracing::error!("[image_cache] failed to load image {}: {}", imgid, e);
                return None;
            }
        };
        Some(match mode {
            LeaseMode::Read => ImageLease::Read(ImageReadGuard::new(entry.try_read_arc()?)),
            LeaseMode::Write => ImageLease::Write(ImageWriteGuard::new(self, entry.try_write_arc()?)),
        })
    }

    /// Refetch the record from the catalog, then hand out the requested lease.
    ///
    /// The refresh happens under a write lease; a read request is served by
    /// downgrading that same lease, so no writer can slip in between.
    pub fn get_reload(&self, imgid: i32, mode: LeaseMode) -> Option<ImageLease<'_>> {
        let entry = self.entry(imgid)?;
        let mut guard = entry.write_arc();

        match self.library.load_image(imgid) {
            Ok(Some(fresh)) => *guard = fresh,
            Ok(None) => {
                tracing::warn!("[image_cache] image {} vanished from the catalog", imgid);
                drop(guard);
                self.cache.remove(imgid);
                return None;
            }
            Err(e) => {
                tracing::error!("[image_cache] failed to reload image {}: {}", imgid, e);
                return None;
            }
        }

        Some(match mode {
            LeaseMode::Read => ImageLease::Read(ImageReadGuard::new(ArcRwLockWriteGuard::downgrade(guard))),
            LeaseMode::Write => ImageLease::Write(ImageWriteGuard::new(self, guard)),
        })
    }

    /// Populate an entry from a caller-owned record without touching the catalog.
    /// A record without a valid id is refused.
    pub fn seed(&self, mut record: ImageRecord) -> SeedOutcome {
        if record.id <= 0 {
            tracing::warn!("[image_cache] refusing to seed a record with id {}", record.id);
            return SeedOutcome::Failed;
        }
        record.refresh_paths();
        record.refresh_derived();
        record.self_hash = record.significant_hash();
        let cost = record_cost(&record);
        self.cache.seed(record.id, record, cost)
    }

    /// Forget an image, waiting for its leases to be released.
    pub fn remove(&self, imgid: i32) -> bool {
        self.cache.remove(imgid)
    }

    pub fn contains(&self, imgid: i32) -> bool {
        self.cache.contains(imgid)
    }

    pub fn set_export_timestamp(&self, imgid: i32) -> Result<(), CacheError> {
        let mut img = self.write(imgid).ok_or(CacheError::Missing(imgid))?;
        img.export_timestamp = chrono::Utc::now().timestamp_micros();
        img.release(WritePolicy::Relaxed)
    }

    pub fn set_print_timestamp(&self, imgid: i32) -> Result<(), CacheError> {
        let mut img = self.write(imgid).ok_or(CacheError::Missing(imgid))?;
        img.print_timestamp = chrono::Utc::now().timestamp_micros();
        img.release(WritePolicy::Relaxed)
    }

    /// Refresh cached copies of images another component changed in the catalog.
    pub fn reload_cached(&self, imgids: &[i32]) {
        for &imgid in imgids {
            if self.cache.contains(imgid) {
                drop(self.get_reload(imgid, LeaseMode::Read));
            }
        }
    }

    /// Register the cache as the first listener of image-info-changed, so
    /// every later listener reads fresh records.
    pub fn connect_info_changed_first(bus: &SignalBus, cache: &Arc<ImageCache>) {
        let weak: Weak<ImageCache> = Arc::downgrade(cache);
        bus.connect_first(SignalKind::ImageInfoChanged, move |signal| {
            if let (Signal::ImageInfoChanged(imgids), Some(cache)) = (signal, weak.upgrade()) {
                cache.reload_cached(imgids);
            }
        });
    }

    fn write_through(&self, img: &mut ImageRecord, changed: bool) -> Result<(), CacheError> {
        if changed {
            img.change_timestamp = chrono::Utc::now().timestamp_micros();
        }
        img.refresh_paths();

        self.library.update_image(img)?;
        self.library.set_color_labels(img.id, img.color_labels)?;
        self.library.write_history_hash(img.id, img.history_hash, img.mipmap_hash)?;

        img.self_hash = img.significant_hash();
        Ok(())
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("cache", &self.cache)
            .field("write_sidecar_files", &self.write_sidecar_files)
            .finish()
    }
}

pub enum ImageLease<'a> {
    Read(ImageReadGuard),
    Write(ImageWriteGuard<'a>),
}

impl Deref for ImageLease<'_> {
    type Target = ImageRecord;

    fn deref(&self) -> &ImageRecord {
        match self {
            ImageLease::Read(guard) => guard,
            ImageLease::Write(guard) => guard,
        }
    }
}

/// Shared lease. Dropping it checks the record was left untouched.
pub struct ImageReadGuard {
    guard: ReadLease<ImageRecord>,
}

impl ImageReadGuard {
    fn new(guard: ReadLease<ImageRecord>) -> Self {
        Self { guard }
    }
}

impl Deref for ImageReadGuard {
    type Target = ImageRecord;

    fn deref(&self) -> &ImageRecord {
        &self.guard
    }
}

impl Drop for ImageReadGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let current = self.guard.significant_hash();
        if current != self.guard.self_hash {
            tracing::error!(
                "[image_cache] image {} was modified under a read lease ({:#x} != {:#x})",
                self.guard.id,
                current,
                self.guard.self_hash
            );
            panic!("image {} modified under a read lease", self.guard.id);
        }
    }
}

/// Exclusive lease. Commit it with [`ImageWriteGuard::release`]; dropping it
/// without a release behaves as [`WritePolicy::Minimal`].
pub struct ImageWriteGuard<'a> {
    cache: &'a ImageCache,
    guard: Option<WriteLease<ImageRecord>>,
}

impl<'a> ImageWriteGuard<'a> {
    fn new(cache: &'a ImageCache, guard: WriteLease<ImageRecord>) -> Self {
        Self { cache, guard: Some(guard) }
    }

    pub fn release(mut self, policy: WritePolicy) -> Result<(), CacheError> {
        let Some(mut guard) = self.guard.take() else {
            return Ok(());
        };
        let changed = guard.significant_hash() != guard.self_hash;

        if policy == WritePolicy::Minimal {
            if changed {
                minimal_release_violation(guard.id);
            }
            return Ok(());
        }

        let imgid = guard.id;
        if let Err(e) = self.cache.write_through(&mut guard, changed) {
            tracing::error!("[image_cache] write-through of image {} failed: {}", imgid, e);
            // the catalog may hold part of the change: resync from it, or forget the entry
            match self.cache.library.load_image(imgid) {
                Ok(Some(fresh)) => {
                    *guard = fresh;
                    guard.self_hash = guard.significant_hash();
                }
                _ => {
                    drop(guard);
                    self.cache.remove(imgid);
                }
            }
            return Err(e);
        }
        drop(guard);

        if policy == WritePolicy::Safe && self.cache.write_sidecar_files {
            if let Some(writer) = self.cache.sidecar.get() {
                writer.enqueue(imgid);
            }
        }
        Ok(())
    }
}

fn minimal_release_violation(imgid: i32) -> ! {
    tracing::error!("[image_cache] image {} modified but released with the minimal policy", imgid);
    panic!("image {} modified but released with the minimal policy", imgid);
}

impl Deref for ImageWriteGuard<'_> {
    type Target = ImageRecord;

    fn deref(&self) -> &ImageRecord {
        self.guard.as_deref().unwrap_or_else(|| unreachable!("write lease used after release"))
    }
}

impl DerefMut for ImageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut ImageRecord {
        self.guard.as_deref_mut().unwrap_or_else(|| unreachable!("write lease used after release"))
    }
}

impl Drop for ImageWriteGuard<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        if !std::thread::panicking() && guard.significant_hash() != guard.self_hash {
            minimal_release_violation(guard.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::data::ImageFlags;

    fn setup() -> (Arc<ImageCache>, i32) {
        let library = Library::open_in_memory().unwrap();
        let film = library.insert_film_roll("/photos/roll").unwrap();
        let imgid = library
            .insert_image(&ImageRecord {
                film_id: film,
                filename: "e.dng".to_string(),
                flags: ImageFlags::RAW,
                ..Default::default()
            })
            .unwrap();
        let cache = ImageCache::new(Arc::new(library), 1 << 20, true);
        (Arc::new(cache), imgid)
    }

    #[test]
    fn test_get_missing() {
        let (cache, _) = setup();
        assert!(cache.get(999, LeaseMode::Read).is_none());
        assert!(cache.get(-1, LeaseMode::Read).is_none());
        assert!(!cache.contains(999));
    }

    #[test]
    fn test_write_through_round_trip() {
        let (cache, imgid) = setup();

        let before = {
            let mut img = cache.write(imgid).unwrap();
            img.orientation = 6;
            img.color_labels = 0b11;
            img.flags |= ImageFlags::AUTO_PRESETS_APPLIED;
            img.refresh_derived();
            img.release(WritePolicy::Relaxed).unwrap();
            cache.read(imgid).unwrap().clone()
        };
        assert!(before.change_timestamp > 0);

        let reloaded = match cache.get_reload(imgid, LeaseMode::Read).unwrap() {
            ImageLease::Read(guard) => guard.clone(),
            ImageLease::Write(_) => unreachable!(),
        };
        assert_eq!(reloaded, before);
        assert_eq!(reloaded.color_labels, 0b11);
        assert_eq!(reloaded.self_hash, reloaded.significant_hash());
    }

    #[test]
    fn test_unchanged_release_keeps_timestamp() {
        let (cache, imgid) = setup();
        let img = cache.write(imgid).unwrap();
        img.release(WritePolicy::Relaxed).unwrap();
        assert_eq!(cache.read(imgid).unwrap().change_timestamp, 0);
    }

    #[test]
    #[should_panic(expected = "minimal policy")]
    fn test_minimal_after_change_panics() {
        let (cache, imgid) = setup();
        let mut img = cache.write(imgid).unwrap();
        img.width = 10;
        let _ = img.release(WritePolicy::Minimal);
    }

    #[test]
    #[should_panic(expected = "minimal policy")]
    fn test_dropped_dirty_write_panics() {
        let (cache, imgid) = setup();
        let mut img = cache.write(imgid).unwrap();
        img.height = 10;
    }

    #[test]
    fn test_failed_write_through_resyncs_from_catalog() {
        let (cache, imgid) = setup();
        cache
            .library()
            .conn()
            .execute_batch(
                "CREATE TRIGGER labels_locked BEFORE INSERT ON color_labels
                 BEGIN SELECT RAISE(ABORT, 'labels locked'); END;",
            )
            .unwrap();

        let mut img = cache.write(imgid).unwrap();
        img.orientation = 6;
        img.color_labels = 1;
        assert!(img.release(WritePolicy::Relaxed).is_err());

        // the image row made it, the label did not
        let img = cache.read(imgid).unwrap();
        assert_eq!(img.orientation, 6);
        assert_eq!(img.color_labels, 0);
        assert_eq!(img.self_hash, img.significant_hash());
    }

    #[test]
    fn test_failed_write_through_evicts_unreadable_entry() {
        let (cache, imgid) = setup();
        drop(cache.read(imgid).unwrap());
        cache.library().conn().execute_batch("DROP TABLE color_labels").unwrap();

        let mut img = cache.write(imgid).unwrap();
        img.color_labels = 1;
        assert!(img.release(WritePolicy::Relaxed).is_err());

        assert!(!cache.contains(imgid));
        drop(cache.read(imgid));
    }

    #[test]
    fn test_try_get_busy() {
        let (cache, imgid) = setup();
        let held = cache.write(imgid).unwrap();
        assert!(cache.try_get(imgid, LeaseMode::Read).is_none());
        drop(held);
        assert!(cache.try_get(imgid, LeaseMode::Read).is_some());
    }

    #[test]
    fn test_seed() {
        let (cache, imgid) = setup();
        let record = ImageRecord { id: 500, filename: "seeded.nef".to_string(), ..Default::default() };
        assert_eq!(cache.seed(record.clone()), SeedOutcome::Inserted);
        assert_eq!(cache.seed(record), SeedOutcome::AlreadyPresent);
        assert_eq!(cache.read(500).unwrap().filename, "seeded.nef");

        let _ = cache.read(imgid).unwrap();
        let existing = ImageRecord { id: imgid, ..Default::default() };
        assert_eq!(cache.seed(existing), SeedOutcome::AlreadyPresent);
    }

    #[test]
    fn test_seed_without_id_fails() {
        let (cache, _) = setup();
        let record = ImageRecord { id: 0, filename: "orphan.cr2".to_string(), ..Default::default() };
        assert_eq!(cache.seed(record), SeedOutcome::Failed);
        assert!(!cache.contains(0));
    }

    #[test]
    fn test_export_timestamp() {
        let (cache, imgid) = setup();
        cache.set_export_timestamp(imgid).unwrap();
        let stored: i64 = cache
            .library()
            .conn()
            .query_row("SELECT export_timestamp FROM images WHERE id = ?1", [imgid], |row| row.get(0))
            .unwrap();
        assert!(stored > 0);
    }

    #[test]
    fn test_info_changed_reloads_first() {
        let (cache, imgid) = setup();
        let bus = SignalBus::new();
        ImageCache::connect_info_changed_first(&bus, &cache);

        let _ = cache.read(imgid).unwrap().history_items;
        cache.library().write_history_hash(imgid, 77, 0).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(0u64));
        let (s, c) = (Arc::clone(&seen), Arc::clone(&cache));
        bus.connect(SignalKind::ImageInfoChanged, move |_| {
            *s.lock() = c.read(imgid).map(|img| img.history_hash).unwrap_or(0);
        });

        bus.raise(Signal::ImageInfoChanged(vec![imgid]));
        assert_eq!(*seen.lock(), 77);
    }
}
