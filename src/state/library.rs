use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use super::data::{ImageFlags, ImageRecord, LOAD_IMAGE_SQL};
use crate::error::{SqlContext, StoreError};

/// The Library manages the SQLite catalog database.
/// It stores image metadata, edit history, mask history and module orders.
///
/// Statements go through rusqlite's per-connection statement cache and the
/// connection sits behind a single mutex: every call is lock, fetch the
/// cached statement (reset and cleared on its way back to the cache), bind,
/// step, unlock. No statement is held across calls.
pub struct Library {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl Library {
    /// Open (or create) the catalog at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).ctx("open")?;
        tracing::info!("database initialized at: {}", path.display());

        let library = Library {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        library.init_schema()?;
        Ok(library)
    }

    /// Catalog living in memory only, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().ctx("open_in_memory")?;
        let library = Library {
            conn: Mutex::new(conn),
            db_path: None,
        };
        library.init_schema()?;
        Ok(library)
    }

    /// Initialize the database schema.
    /// Creates all necessary tables and indexes if they don't exist.
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS film_rolls (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                access_timestamp    INTEGER,
                folder              VARCHAR(1024) NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS images (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id            INTEGER,
                film_id             INTEGER,
                version             INTEGER DEFAULT 0,
                width               INTEGER DEFAULT 0,
                height              INTEGER DEFAULT 0,
                orientation         INTEGER DEFAULT -1,
                flags               INTEGER DEFAULT 0,
                import_timestamp    INTEGER,
                change_timestamp    INTEGER,
                export_timestamp    INTEGER,
                print_timestamp     INTEGER,
                exposure            REAL,
                exposure_bias       REAL,
                aperture            REAL,
                iso                 REAL,
                focal_length        REAL,
                focus_distance      REAL,
                datetime_taken      INTEGER,
                longitude           REAL,
                latitude            REAL,
                altitude            REAL,
                filename            VARCHAR,
                maker               VARCHAR,
                model               VARCHAR,
                lens                VARCHAR,
                crop                REAL,
                raw_parameters      INTEGER,
                color_matrix        BLOB,
                colorspace          INTEGER,
                raw_black           INTEGER,
                raw_maximum         INTEGER,
                aspect_ratio        REAL DEFAULT 0.0,
                output_width        INTEGER DEFAULT 0,
                output_height       INTEGER DEFAULT 0,
                history_end         INTEGER DEFAULT 0,
                FOREIGN KEY(film_id) REFERENCES film_rolls(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS history (
                imgid               INTEGER,
                num                 INTEGER,
                module              INTEGER,
                operation           VARCHAR(256),
                op_params           BLOB,
                enabled             INTEGER,
                blendop_params      BLOB,
                blendop_version     INTEGER,
                multi_priority      INTEGER,
                multi_name          VARCHAR(256)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS history_imgid_num ON history (imgid, num);

            CREATE TABLE IF NOT EXISTS masks_history (
                imgid               INTEGER,
                num                 INTEGER,
                formid              INTEGER,
                form                INTEGER,
                name                VARCHAR(256),
                version             INTEGER,
                points              BLOB,
                points_count        INTEGER,
                source              BLOB
            );
            CREATE INDEX IF NOT EXISTS masks_history_imgid_index ON masks_history (imgid, num);

            CREATE TABLE IF NOT EXISTS history_hash (
                imgid               INTEGER PRIMARY KEY,
                basic_hash          INTEGER,
                auto_hash           INTEGER,
                current_hash        INTEGER,
                mipmap_hash         INTEGER
            );

            CREATE TABLE IF NOT EXISTS module_order (
                imgid               INTEGER PRIMARY KEY,
                version             INTEGER,
                iop_list            VARCHAR
            );

            CREATE TABLE IF NOT EXISTS color_labels (
                imgid               INTEGER,
                color               INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS color_labels_idx ON color_labels (imgid, color);

            CREATE TABLE IF NOT EXISTS tags (
                id                  INTEGER PRIMARY KEY,
                name                VARCHAR UNIQUE
            );

            CREATE TABLE IF NOT EXISTS tagged_images (
                imgid               INTEGER,
                tagid               INTEGER,
                position            INTEGER,
                PRIMARY KEY (imgid, tagid)
            );

            CREATE TABLE IF NOT EXISTS presets (
                name                VARCHAR,
                description         VARCHAR,
                operation           VARCHAR,
                op_version          INTEGER,
                op_params           BLOB,
                enabled             INTEGER,
                blendop_params      BLOB,
                blendop_version     INTEGER,
                multi_priority      INTEGER,
                multi_name          VARCHAR(256),
                model               VARCHAR,
                maker               VARCHAR,
                lens                VARCHAR,
                iso_min             REAL,
                iso_max             REAL,
                exposure_min        REAL,
                exposure_max        REAL,
                aperture_min        REAL,
                aperture_max        REAL,
                focal_length_min    REAL,
                focal_length_max    REAL,
                writeprotect        INTEGER,
                autoapply           INTEGER,
                filter              INTEGER,
                def                 INTEGER,
                format              INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS presets_idx ON presets (name, operation, op_version);",
        )
        .ctx("init_schema")?;

        tracing::debug!("database schema initialized");
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Get the path to the database file, `None` for an in-memory catalog
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Get a count of images in the library
    pub fn image_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT COUNT(*) FROM images")
            .ctx("image_count")?;
        stmt.query_row([], |row| row.get(0)).ctx("image_count")
    }

    /// All image ids, ascending
    pub fn image_ids(&self) -> Result<Vec<i32>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT id FROM images ORDER BY id")
            .ctx("image_ids")?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .ctx("image_ids")?
            .collect::<Result<Vec<i32>, _>>()
            .ctx("image_ids")?;
        Ok(ids)
    }

    // ========== Film rolls and import ==========

    /// Film roll id for `folder`, creating the roll when needed
    pub fn insert_film_roll(&self, folder: &str) -> Result<i32, StoreError> {
        let conn = self.conn();
        conn.prepare_cached("INSERT OR IGNORE INTO film_rolls (folder, access_timestamp) VALUES (?1, ?2)")
            .ctx("insert_film_roll")?
            .execute(params![folder, chrono::Utc::now().timestamp_micros()])
            .ctx("insert_film_roll")?;
        let id = conn
            .prepare_cached("SELECT id FROM film_rolls WHERE folder = ?1")
            .ctx("insert_film_roll")?
            .query_row([folder], |row| row.get(0))
            .ctx("insert_film_roll")?;
        Ok(id)
    }

    /// Import a new image into the library.
    ///
    /// Inserts the row, makes it the leader of its own group, then writes every
    /// field of `record` through [`Library::update_image`]. Returns the new id.
    pub fn insert_image(&self, record: &ImageRecord) -> Result<i32, StoreError> {
        let imgid = {
            let conn = self.conn();
            conn.prepare_cached("INSERT INTO images (film_id, filename, import_timestamp) VALUES (?1, ?2, ?3)")
                .ctx("insert_image")?
                .execute(params![
                    record.film_id,
                    record.filename,
                    chrono::Utc::now().timestamp_micros()
                ])
                .ctx("insert_image")?;
            conn.last_insert_rowid() as i32
        };

        let mut stored = record.clone();
        stored.id = imgid;
        if stored.group_id <= 0 {
            stored.group_id = imgid;
        }
        if stored.import_timestamp == 0 {
            stored.import_timestamp = chrono::Utc::now().timestamp_micros();
        }
        self.update_image(&stored)?;
        self.set_color_labels(imgid, stored.color_labels)?;

        tracing::debug!("[library] imported image {} ({})", imgid, stored.filename);
        Ok(imgid)
    }

    // ========== Image records ==========

    /// Load one image with all its aggregates, `None` if the row does not exist
    pub fn load_image(&self, imgid: i32) -> Result<Option<ImageRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(LOAD_IMAGE_SQL).ctx("load_image")?;
        stmt.query_row([imgid], ImageRecord::from_row)
            .optional()
            .ctx("load_image")
    }

    /// Write every mutable field of `img` in a single UPDATE.
    pub fn update_image(&self, img: &ImageRecord) -> Result<(), StoreError> {
        let unset_zero = |ts: i64| (ts != 0).then_some(ts);
        let matrix: Option<Vec<u8>> = img
            .color_matrix
            .map(|m| bytemuck::cast_slice::<f32, u8>(&m).to_vec());

        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "UPDATE images
                    SET width = ?1, height = ?2, filename = ?3, maker = ?4, model = ?5,
                        lens = ?6, exposure = ?7, aperture = ?8, iso = ?9, focal_length = ?10,
                        focus_distance = ?11, film_id = ?12, datetime_taken = ?13, flags = ?14,
                        crop = ?15, orientation = ?16, raw_parameters = ?17, group_id = ?18,
                        longitude = ?19, latitude = ?20, altitude = ?21, color_matrix = ?22,
                        colorspace = ?23, raw_black = ?24, raw_maximum = ?25,
                        import_timestamp = ?26, change_timestamp = ?27, export_timestamp = ?28,
                        print_timestamp = ?29, exposure_bias = ?30, version = ?31
                  WHERE id = ?32",
            )
            .ctx("update_image")?;
        stmt.execute(params![
            img.width,
            img.height,
            img.filename,
            img.exif.maker,
            img.exif.model,
            img.exif.lens,
            img.exif.exposure,
            img.exif.aperture,
            img.exif.iso,
            img.exif.focal_length,
            img.exif.focus_distance,
            img.film_id,
            (img.exif.datetime_taken != 0).then_some(img.exif.datetime_taken),
            i64::from(img.flags.bits()),
            img.exif.crop,
            img.orientation,
            i64::from(img.raw_parameters),
            img.group_id,
            img.geoloc.longitude,
            img.geoloc.latitude,
            img.geoloc.elevation,
            matrix,
            img.colorspace,
            i64::from(img.raw_black_level),
            i64::from(img.raw_white_point),
            unset_zero(img.import_timestamp),
            unset_zero(img.change_timestamp),
            unset_zero(img.export_timestamp),
            unset_zero(img.print_timestamp),
            img.exif.exposure_bias,
            img.version,
            img.id,
        ])
        .ctx("update_image")?;
        Ok(())
    }

    /// Make the `color_labels` rows match the bitmask (bit n = label n).
    pub fn set_color_labels(&self, imgid: i32, labels: u8) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.prepare_cached("DELETE FROM color_labels WHERE imgid = ?1")
            .ctx("set_color_labels")?
            .execute([imgid])
            .ctx("set_color_labels")?;

        let mut insert = conn
            .prepare_cached("INSERT INTO color_labels (imgid, color) VALUES (?1, ?2)")
            .ctx("set_color_labels")?;
        for color in (0..5).filter(|bit| labels & (1 << bit) != 0) {
            insert.execute(params![imgid, color]).ctx("set_color_labels")?;
        }
        Ok(())
    }

    /// Flag bits as stored, without going through the cache
    pub fn image_flags(&self, imgid: i32) -> Result<Option<ImageFlags>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT flags FROM images WHERE id = ?1")
            .ctx("image_flags")?;
        let flags = stmt
            .query_row([imgid], |row| row.get::<_, Option<i64>>(0))
            .optional()
            .ctx("image_flags")?;
        Ok(flags.map(|bits| ImageFlags::from_bits_retain(bits.unwrap_or(0) as u32)))
    }

    // ========== History hash ==========

    /// Upsert the hash row of an image.
    pub fn write_history_hash(&self, imgid: i32, current_hash: u64, mipmap_hash: u64) -> Result<(), StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO history_hash (imgid, current_hash, mipmap_hash)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (imgid)
                 DO UPDATE SET current_hash = ?2, mipmap_hash = ?3",
            )
            .ctx("write_history_hash")?;
        stmt.execute(params![imgid, current_hash as i64, mipmap_hash as i64])
            .ctx("write_history_hash")?;
        Ok(())
    }

    /// `(current_hash, mipmap_hash)`, `None` when no row exists
    pub fn read_history_hash(&self, imgid: i32) -> Result<Option<(u64, u64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT current_hash, mipmap_hash FROM history_hash WHERE imgid = ?1")
            .ctx("read_history_hash")?;
        let row = stmt
            .query_row([imgid], |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?.unwrap_or(0) as u64,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                ))
            })
            .optional()
            .ctx("read_history_hash")?;
        Ok(row)
    }

    // ========== Tags ==========

    /// Attach `name` to the image, creating the tag when needed.
    pub fn attach_tag(&self, imgid: i32, name: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.prepare_cached("INSERT OR IGNORE INTO tags (name) VALUES (?1)")
            .ctx("attach_tag")?
            .execute([name])
            .ctx("attach_tag")?;
        conn.prepare_cached(
            "INSERT OR IGNORE INTO tagged_images (imgid, tagid, position)
             SELECT ?1, id, (SELECT IFNULL(MAX(position), 0) + 1 FROM tagged_images WHERE imgid = ?1)
               FROM tags WHERE name = ?2",
        )
        .ctx("attach_tag")?
        .execute(params![imgid, name])
        .ctx("attach_tag")?;
        Ok(())
    }

    /// Detach every tag whose name matches the SQL `LIKE` pattern.
    /// Returns the number of detached tags.
    pub fn detach_tags_like(&self, imgid: i32, pattern: &str) -> Result<usize, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "DELETE FROM tagged_images
                  WHERE imgid = ?1
                    AND tagid IN (SELECT id FROM tags WHERE name LIKE ?2)",
            )
            .ctx("detach_tags_like")?;
        stmt.execute(params![imgid, pattern]).ctx("detach_tags_like")
    }

    /// Tag names attached to the image, in attach order
    pub fn image_tags(&self, imgid: i32) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT t.name FROM tagged_images AS ti
                   JOIN tags AS t ON t.id = ti.tagid
                  WHERE ti.imgid = ?1
                  ORDER BY ti.position",
            )
            .ctx("image_tags")?;
        let names = stmt
            .query_map([imgid], |row| row.get(0))
            .ctx("image_tags")?
            .collect::<Result<Vec<String>, _>>()
            .ctx("image_tags")?;
        Ok(names)
    }
}

// Implement Debug for better error messages
impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::data::ExifData;

    fn import(library: &Library) -> i32 {
        let film = library.insert_film_roll("/photos/roll").unwrap();
        let record = ImageRecord {
            film_id: film,
            filename: "IMG_0001.CR2".to_string(),
            width: 6000,
            height: 4000,
            flags: ImageFlags::RAW,
            color_labels: 0b101,
            exif: ExifData {
                maker: "Canon".to_string(),
                model: "EOS R5".to_string(),
                iso: 400.0,
                exposure_bias: Some(-0.7),
                ..Default::default()
            },
            ..Default::default()
        };
        library.insert_image(&record).unwrap()
    }

    #[test]
    fn test_schema_is_idempotent() {
        let library = Library::open_in_memory().unwrap();
        library.init_schema().unwrap();
        assert_eq!(library.image_count().unwrap(), 0);
    }

    #[test]
    fn test_import_and_load() {
        let library = Library::open_in_memory().unwrap();
        let imgid = import(&library);

        let img = library.load_image(imgid).unwrap().unwrap();
        assert_eq!(img.id, imgid);
        assert_eq!(img.group_id, imgid);
        assert_eq!(img.group_members, 1);
        assert_eq!(img.folder, "/photos/roll");
        assert_eq!(img.filmroll, "roll");
        assert_eq!(img.color_labels, 0b101);
        assert_eq!(img.exif.model, "EOS R5");
        assert_eq!(img.exif.exposure_bias, Some(-0.7));
        assert!(img.is_raw());
        assert_eq!(img.self_hash, img.significant_hash());
    }

    #[test]
    fn test_missing_image() {
        let library = Library::open_in_memory().unwrap();
        assert!(library.load_image(42).unwrap().is_none());
    }

    #[test]
    fn test_update_round_trip() {
        let library = Library::open_in_memory().unwrap();
        let imgid = import(&library);

        let mut img = library.load_image(imgid).unwrap().unwrap();
        img.orientation = 5;
        img.flags |= ImageFlags::AUTO_PRESETS_APPLIED;
        img.color_matrix = Some([0.5, 0.1, 0.0, 0.0, 1.0, 0.0, 0.0, 0.2, 0.7]);
        img.change_timestamp = 17;
        library.update_image(&img).unwrap();

        let reloaded = library.load_image(imgid).unwrap().unwrap();
        assert_eq!(reloaded.orientation, 5);
        assert_eq!(reloaded.color_matrix, img.color_matrix);
        assert_eq!(reloaded.change_timestamp, 17);
        assert!(reloaded.flags.contains(ImageFlags::AUTO_PRESETS_APPLIED));
    }

    #[test]
    fn test_history_hash_upsert() {
        let library = Library::open_in_memory().unwrap();
        let imgid = import(&library);

        library.write_history_hash(imgid, 11, 0).unwrap();
        library.write_history_hash(imgid, 12, 11).unwrap();
        assert_eq!(library.read_history_hash(imgid).unwrap(), Some((12, 11)));

        let img = library.load_image(imgid).unwrap().unwrap();
        assert_eq!(img.history_hash, 12);
        assert_eq!(img.mipmap_hash, 11);
    }

    #[test]
    fn test_tags() {
        let library = Library::open_in_memory().unwrap();
        let imgid = import(&library);

        library.attach_tag(imgid, "darktable|changed").unwrap();
        library.attach_tag(imgid, "darktable|style|warm").unwrap();
        library.attach_tag(imgid, "people|alice").unwrap();
        assert_eq!(library.image_tags(imgid).unwrap().len(), 3);

        let detached = library.detach_tags_like(imgid, "darktable|style|%").unwrap();
        assert_eq!(detached, 1);
        assert_eq!(
            library.image_tags(imgid).unwrap(),
            vec!["darktable|changed".to_string(), "people|alice".to_string()]
        );
    }
}
