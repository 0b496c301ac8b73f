/// Shared data structures for the image catalog
///
/// `ImageRecord` is the in-memory mirror of one `images` row plus the
/// aggregates the cache computes at load time (group size, history length,
/// hashes, color labels) and the fields derived from the flag bits.
use bitflags::bitflags;
use chrono::DateTime;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hash::ContentHasher;

bitflags! {
    /// Flag bits stored in `images.flags`
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageFlags: u32 {
        /// Star rating, 0..=5 (6 is the legacy reject value)
        const RATING_MASK = 0x7;
        const REJECTED = 0x8;
        const THUMBNAIL_DEPRECATED = 0x10;
        const LDR = 0x20;
        const RAW = 0x40;
        const HDR = 0x80;
        const REMOVE = 0x100;
        const AUTO_PRESETS_APPLIED = 0x200;
        const NO_LEGACY_PRESETS = 0x400;
        const LOCAL_COPY = 0x800;
        const HAS_TXT = 0x1000;
        const HAS_WAV = 0x2000;
        const MONOCHROME = 0x8000;
        const MONOCHROME_PREVIEW = 0x1_0000;
        const MONOCHROME_BAYER = 0x2_0000;
        const MONOCHROME_WORKFLOW = 0x4_0000;
    }
}

/// Pixel storage of the decoded input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelType {
    #[default]
    Uint16,
    Float,
}

/// Color space of the decoded input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferColorSpace {
    #[default]
    Raw,
    Rgb,
}

/// How the decoder hands pixels to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    pub channels: u8,
    pub datatype: PixelType,
    pub cst: BufferColorSpace,
}

impl BufferDescriptor {
    /// Interpretation of the input buffer implied by the format flags
    pub fn from_flags(flags: ImageFlags) -> Self {
        if flags.contains(ImageFlags::LDR) {
            Self { channels: 4, datatype: PixelType::Float, cst: BufferColorSpace::Rgb }
        } else if flags.contains(ImageFlags::HDR) {
            if flags.contains(ImageFlags::RAW) {
                Self { channels: 1, datatype: PixelType::Float, cst: BufferColorSpace::Raw }
            } else {
                Self { channels: 4, datatype: PixelType::Float, cst: BufferColorSpace::Rgb }
            }
        } else {
            Self { channels: 1, datatype: PixelType::Uint16, cst: BufferColorSpace::Raw }
        }
    }
}

/// Capture metadata
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExifData {
    pub maker: String,
    pub model: String,
    pub lens: String,
    pub exposure: f32,
    /// `None` when the camera did not record it
    pub exposure_bias: Option<f32>,
    pub aperture: f32,
    pub iso: f32,
    pub focal_length: f32,
    pub focus_distance: f32,
    pub crop: f32,
    /// Microseconds since the Unix epoch, 0 when unknown
    pub datetime_taken: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GeoLocation {
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub elevation: Option<f64>,
}

/// One image of the catalog
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageRecord {
    /// Unique database ID (positive)
    pub id: i32,
    pub group_id: i32,
    pub film_id: i32,
    pub version: i32,

    pub width: i32,
    pub height: i32,
    pub orientation: i32,
    pub flags: ImageFlags,

    // ========== Timestamps (microseconds, 0 = unset, -1 = pre-3.0 edit) ==========
    pub import_timestamp: i64,
    pub change_timestamp: i64,
    pub export_timestamp: i64,
    pub print_timestamp: i64,

    pub exif: ExifData,
    pub geoloc: GeoLocation,

    // ========== Location on disk ==========
    pub filename: String,
    pub folder: String,
    pub fullpath: String,
    pub local_copy_path: String,
    pub local_copy_legacy_path: String,

    /// Bitmask of color labels, bit `n` = label `n` (0..=4)
    pub color_labels: u8,

    pub raw_parameters: u32,
    pub color_matrix: Option<[f32; 9]>,
    pub colorspace: i32,
    pub raw_black_level: u16,
    pub raw_white_point: u16,

    // ========== Aggregates computed by the load query ==========
    pub group_members: u32,
    pub history_items: u32,
    pub history_hash: u64,
    pub mipmap_hash: u64,

    /// Integrity hash, see [`ImageRecord::significant_hash`]
    pub self_hash: u64,

    // ========== Derived at load time ==========
    pub buf_dsc: BufferDescriptor,
    pub filmroll: String,
    pub datetime: String,
    pub rating: i8,
    pub has_localcopy: bool,
    pub has_audio: bool,
    pub is_bw: bool,
    pub is_bw_flow: bool,
    pub is_hdr: bool,
    pub exif_inited: bool,
}

/// Load query whose columns [`ImageRecord::from_row`] expects, in order.
pub const LOAD_IMAGE_SQL: &str = "SELECT i.id, i.group_id, \
       (SELECT COUNT(id) FROM images WHERE group_id = i.group_id), \
       (SELECT COUNT(imgid) FROM history WHERE imgid = i.id), \
       COALESCE((SELECT current_hash FROM history_hash WHERE imgid = i.id), 0), \
       COALESCE((SELECT mipmap_hash FROM history_hash WHERE imgid = i.id), 0), \
       i.film_id, i.version, i.width, i.height, i.orientation, i.flags, \
       i.import_timestamp, i.change_timestamp, i.export_timestamp, i.print_timestamp, \
       i.exposure, i.exposure_bias, i.aperture, i.iso, i.focal_length, i.focus_distance, \
       i.datetime_taken, i.longitude, i.latitude, i.altitude, \
       i.filename, f.folder, \
       i.maker, i.model, i.lens, \
       COALESCE((SELECT SUM(1 << color) FROM color_labels WHERE imgid = i.id), 0), \
       i.crop, i.raw_parameters, i.color_matrix, i.colorspace, \
       i.raw_black, i.raw_maximum \
  FROM images AS i \
  LEFT JOIN film_rolls AS f ON f.id = i.film_id \
  WHERE i.id = ?1";

impl ImageRecord {
    /// Build a record from a row selected with [`LOAD_IMAGE_SQL`].
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let matrix_blob: Option<Vec<u8>> = row.get(34)?;
        let color_matrix = matrix_blob
            .as_deref()
            .and_then(|blob| bytemuck::try_pod_read_unaligned::<[f32; 9]>(blob).ok())
            .filter(|m| m[0].is_finite());

        let mut img = Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            group_members: row.get::<_, i64>(2)? as u32,
            history_items: row.get::<_, i64>(3)? as u32,
            history_hash: row.get::<_, i64>(4)? as u64,
            mipmap_hash: row.get::<_, i64>(5)? as u64,
            film_id: row.get::<_, Option<i32>>(6)?.unwrap_or(-1),
            version: row.get::<_, Option<i32>>(7)?.unwrap_or(0),
            width: row.get::<_, Option<i32>>(8)?.unwrap_or(0),
            height: row.get::<_, Option<i32>>(9)?.unwrap_or(0),
            orientation: row.get::<_, Option<i32>>(10)?.unwrap_or(-1),
            flags: ImageFlags::from_bits_retain(row.get::<_, Option<i64>>(11)?.unwrap_or(0) as u32),
            import_timestamp: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
            change_timestamp: row.get::<_, Option<i64>>(13)?.unwrap_or(0),
            export_timestamp: row.get::<_, Option<i64>>(14)?.unwrap_or(0),
            print_timestamp: row.get::<_, Option<i64>>(15)?.unwrap_or(0),
            exif: ExifData {
                exposure: row.get::<_, Option<f64>>(16)?.unwrap_or(0.0) as f32,
                exposure_bias: row.get::<_, Option<f64>>(17)?.map(|v| v as f32),
                aperture: row.get::<_, Option<f64>>(18)?.unwrap_or(0.0) as f32,
                iso: row.get::<_, Option<f64>>(19)?.unwrap_or(0.0) as f32,
                focal_length: row.get::<_, Option<f64>>(20)?.unwrap_or(0.0) as f32,
                focus_distance: row.get::<_, Option<f64>>(21)?.unwrap_or(0.0) as f32,
                datetime_taken: row.get::<_, Option<i64>>(22)?.unwrap_or(0),
                maker: row.get::<_, Option<String>>(28)?.unwrap_or_default(),
                model: row.get::<_, Option<String>>(29)?.unwrap_or_default(),
                lens: row.get::<_, Option<String>>(30)?.unwrap_or_default(),
                crop: row.get::<_, Option<f64>>(32)?.unwrap_or(0.0) as f32,
            },
            geoloc: GeoLocation {
                longitude: row.get(23)?,
                latitude: row.get(24)?,
                elevation: row.get(25)?,
            },
            filename: row.get::<_, Option<String>>(26)?.unwrap_or_default(),
            folder: row.get::<_, Option<String>>(27)?.unwrap_or_default(),
            color_labels: (row.get::<_, i64>(31)? & 0x1f) as u8,
            raw_parameters: row.get::<_, Option<i64>>(33)?.unwrap_or(0) as u32,
            color_matrix,
            colorspace: row.get::<_, Option<i32>>(35)?.unwrap_or(0),
            raw_black_level: row.get::<_, Option<i64>>(36)?.unwrap_or(0) as u16,
            raw_white_point: row.get::<_, Option<i64>>(37)?.unwrap_or(0) as u16,
            ..Default::default()
        };

        img.refresh_paths();
        img.refresh_derived();
        img.self_hash = img.significant_hash();
        Ok(img)
    }

    /// Recompute `fullpath`, the film roll label and the local-copy paths
    /// from `folder` and `filename`.
    pub fn refresh_paths(&mut self) {
        if !self.folder.is_empty() && !self.filename.is_empty() {
            self.fullpath = Path::new(&self.folder)
                .join(&self.filename)
                .to_string_lossy()
                .into_owned();
        }

        self.filmroll = if !self.folder.is_empty() {
            film_roll_name(&self.folder)
        } else if self.film_id < 0 {
            "orphaned image".to_string()
        } else {
            String::new()
        };

        if !self.fullpath.is_empty() {
            let (path, legacy) = local_copy_paths(&self.fullpath, self.id);
            self.local_copy_path = path.to_string_lossy().into_owned();
            self.local_copy_legacy_path = legacy.to_string_lossy().into_owned();
        }
    }

    /// Recompute every field that only depends on flags and capture data.
    pub fn refresh_derived(&mut self) {
        self.buf_dsc = BufferDescriptor::from_flags(self.flags);
        self.has_localcopy = self.flags.contains(ImageFlags::LOCAL_COPY);
        self.has_audio = self.flags.contains(ImageFlags::HAS_WAV);
        self.rating = rating_from_flags(self.flags);
        self.is_bw = self.is_monochrome();
        self.is_bw_flow = self.is_bw && self.flags.contains(ImageFlags::MONOCHROME_WORKFLOW);
        self.is_hdr = self.flags.contains(ImageFlags::HDR);
        self.exif_inited = self.exif.focus_distance >= 0.0 && self.orientation >= 0;
        self.datetime = format_datetime(self.exif.datetime_taken);
    }

    /// Hash over every significant field.
    ///
    /// The self hash and the four timestamps are left out: the release path
    /// updates those itself.
    pub fn significant_hash(&self) -> u64 {
        let mut h = ContentHasher::new();
        h.i32(self.id)
            .i32(self.group_id)
            .i32(self.film_id)
            .i32(self.version)
            .i32(self.width)
            .i32(self.height)
            .i32(self.orientation)
            .u32(self.flags.bits());

        let exif = &self.exif;
        h.str(&exif.maker)
            .str(&exif.model)
            .str(&exif.lens)
            .f32(exif.exposure)
            .opt_f64(exif.exposure_bias.map(f64::from))
            .f32(exif.aperture)
            .f32(exif.iso)
            .f32(exif.focal_length)
            .f32(exif.focus_distance)
            .f32(exif.crop)
            .i64(exif.datetime_taken);

        h.opt_f64(self.geoloc.longitude)
            .opt_f64(self.geoloc.latitude)
            .opt_f64(self.geoloc.elevation);

        h.str(&self.filename)
            .str(&self.folder)
            .str(&self.fullpath)
            .str(&self.local_copy_path)
            .str(&self.local_copy_legacy_path)
            .u32(u32::from(self.color_labels))
            .u32(self.raw_parameters);

        match &self.color_matrix {
            Some(m) => {
                h.bool(true).bytes(bytemuck::cast_slice(m));
            }
            None => {
                h.bool(false);
            }
        }

        h.i32(self.colorspace)
            .u32(u32::from(self.raw_black_level))
            .u32(u32::from(self.raw_white_point))
            .u32(self.group_members)
            .u32(self.history_items)
            .u64(self.history_hash)
            .u64(self.mipmap_hash);

        h.u32(u32::from(self.buf_dsc.channels))
            .u32(self.buf_dsc.datatype as u32)
            .u32(self.buf_dsc.cst as u32)
            .str(&self.filmroll)
            .str(&self.datetime)
            .i32(i32::from(self.rating))
            .bool(self.has_localcopy)
            .bool(self.has_audio)
            .bool(self.is_bw)
            .bool(self.is_bw_flow)
            .bool(self.is_hdr)
            .bool(self.exif_inited);

        h.finish()
    }

    pub fn is_raw(&self) -> bool {
        self.flags.contains(ImageFlags::RAW)
    }

    pub fn is_ldr(&self) -> bool {
        self.flags.contains(ImageFlags::LDR)
    }

    pub fn is_hdr(&self) -> bool {
        self.flags.contains(ImageFlags::HDR)
    }

    /// Any of the monochrome bits is set
    pub fn is_monochrome(&self) -> bool {
        self.flags.intersects(
            ImageFlags::MONOCHROME | ImageFlags::MONOCHROME_PREVIEW | ImageFlags::MONOCHROME_BAYER,
        )
    }

    /// A raw image goes through rawprepare unless it is already demosaiced floating point
    pub fn is_rawprepare_supported(&self) -> bool {
        self.is_raw() && !(self.is_hdr() && self.buf_dsc.channels == 4)
    }

    /// Raw image with a usable camera color matrix
    pub fn is_matrix_correction_supported(&self) -> bool {
        self.is_raw()
            && self
                .color_matrix
                .as_ref()
                .is_some_and(crate::color::is_usable_matrix)
    }
}

/// Star rating encoded in the low flag bits, -1 for rejected images
pub fn rating_from_flags(flags: ImageFlags) -> i8 {
    if flags.contains(ImageFlags::REJECTED) {
        return -1;
    }
    match (flags & ImageFlags::RATING_MASK).bits() {
        6 => -1,
        stars => stars.min(5) as i8,
    }
}

/// Last folder component, used as the film roll label
pub fn film_roll_name(folder: &str) -> String {
    Path::new(folder)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.to_string())
}

/// Local-copy locations for an image: the current naming scheme
/// (`<stem>_<imgid>.<ext>`) and the legacy one (`<imgid>_<filename>`).
pub fn local_copy_paths(fullpath: &str, imgid: i32) -> (PathBuf, PathBuf) {
    let mut root = dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    root.push("raw-editor");
    root.push("img");

    let source = Path::new(fullpath);
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = source
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let current = match source.extension() {
        Some(ext) => root.join(format!("{}_{:06}.{}", stem, imgid, ext.to_string_lossy())),
        None => root.join(format!("{}_{:06}", stem, imgid)),
    };
    let legacy = root.join(format!("{}_{}", imgid, filename));
    (current, legacy)
}

fn format_datetime(micros: i64) -> String {
    if micros == 0 {
        return String::new();
    }
    DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.format("%Y:%m:%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
