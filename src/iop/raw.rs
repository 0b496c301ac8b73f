/// Raw preparation, white balance, highlight reconstruction and demosaicing

use bytemuck::{Pod, Zeroable};

use super::{decode, migrate, params_bytes};
use crate::color;
use crate::config::ChromaticAdaptation;
use crate::develop::module::{DefaultsEnv, IopDefinition, IopFlags, ModuleDefaults};
use crate::error::MigrationError;
use crate::state::data::ImageRecord;

// ========== rawprepare ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct RawPrepareParams {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub raw_black_level_separate: [u32; 4],
    pub raw_white_point: u32,
    pub flat_field: i32,
}

pub struct RawPrepare;

impl IopDefinition for RawPrepare {
    fn op(&self) -> &'static str {
        "rawprepare"
    }

    fn name(&self) -> &'static str {
        "raw black/white point"
    }

    fn version(&self) -> i32 {
        2
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<RawPrepareParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::ALLOW_TILING | IopFlags::ONE_INSTANCE | IopFlags::UNSAFE_COPY
    }

    fn hide_enable_button(&self) -> bool {
        true
    }

    fn reload_defaults(&self, image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        let black = u32::from(image.raw_black_level);
        let params = RawPrepareParams {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            raw_black_level_separate: [black; 4],
            raw_white_point: if image.raw_white_point > 0 { u32::from(image.raw_white_point) } else { u32::from(u16::MAX) },
            flat_field: 0,
        };
        ModuleDefaults {
            params: params_bytes(&params),
            default_enabled: image.is_rawprepare_supported(),
            workflow_enabled: false,
        }
    }

    /// Runs exactly when the image needs it, whatever history says
    fn force_enable(&self, image: &ImageRecord, _current: bool) -> Option<bool> {
        Some(image.is_rawprepare_supported())
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        let Some(p) = decode::<RawPrepareParams>(params) else {
            return Vec::new();
        };
        let white = p.raw_white_point.max(1) as f32;
        let mut state: Vec<f32> = p.raw_black_level_separate.iter().map(|&b| b as f32 / white).collect();
        state.push(white);
        state
    }
}

// ========== temperature ==========

pub const WB_PRESET_AS_SHOT: i32 = 0;
pub const WB_PRESET_D65: i32 = 1;
pub const WB_PRESET_USER: i32 = 2;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct TemperatureParams {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub g2: f32,
    pub preset: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct TemperatureParamsV2 {
    pub temp_out: f32,
    pub coeffs: [f32; 3],
}

pub struct Temperature;

impl Temperature {
    /// Defaults under an explicit chromatic adaptation, whatever the configuration says
    pub fn defaults_for(image: &ImageRecord, adaptation: ChromaticAdaptation) -> TemperatureParams {
        let coeffs = match (adaptation, image.color_matrix.as_ref()) {
            (ChromaticAdaptation::Legacy, Some(matrix)) if image.is_raw() => color::as_shot_coefficients(matrix),
            _ => [1.0, 1.0, 1.0, 1.0],
        };
        let preset = match adaptation {
            ChromaticAdaptation::Modern if image.is_matrix_correction_supported() => WB_PRESET_D65,
            _ => WB_PRESET_AS_SHOT,
        };
        TemperatureParams { red: coeffs[0], green: coeffs[1], blue: coeffs[2], g2: coeffs[3], preset }
    }
}

impl IopDefinition for Temperature {
    fn op(&self) -> &'static str {
        "temperature"
    }

    fn name(&self) -> &'static str {
        "white balance"
    }

    fn version(&self) -> i32 {
        3
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<TemperatureParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::ALLOW_TILING | IopFlags::ONE_INSTANCE | IopFlags::UNSAFE_COPY
    }

    fn reload_defaults(&self, image: &ImageRecord, env: &DefaultsEnv) -> ModuleDefaults {
        ModuleDefaults {
            params: params_bytes(&Self::defaults_for(image, env.chromatic_adaptation)),
            default_enabled: image.is_raw(),
            workflow_enabled: false,
        }
    }

    fn legacy_params(&self, old: &[u8], old_version: i32) -> Result<Vec<u8>, MigrationError> {
        match old_version {
            2 => migrate(old, |o: TemperatureParamsV2| TemperatureParams {
                red: o.coeffs[0],
                green: o.coeffs[1],
                blue: o.coeffs[2],
                g2: o.coeffs[1],
                preset: WB_PRESET_USER,
            }),
            _ => Err(MigrationError::Unsupported { from: old_version, to: self.version() }),
        }
    }

    /// Channel multipliers normalized to green
    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        let Some(p) = decode::<TemperatureParams>(params) else {
            return Vec::new();
        };
        let green = if p.green.abs() > f32::EPSILON { p.green } else { 1.0 };
        vec![p.red / green, 1.0, p.blue / green, p.g2 / green]
    }
}

// ========== highlights ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct HighlightsParams {
    pub mode: i32,
    pub blend_l: f32,
    pub blend_c: f32,
    pub blend_h: f32,
    pub clip: f32,
}

pub struct Highlights;

impl IopDefinition for Highlights {
    fn op(&self) -> &'static str {
        "highlights"
    }

    fn name(&self) -> &'static str {
        "highlight reconstruction"
    }

    fn version(&self) -> i32 {
        2
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<HighlightsParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::ALLOW_TILING | IopFlags::ONE_INSTANCE
    }

    fn reload_defaults(&self, image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        let params = HighlightsParams { mode: 0, blend_l: 1.0, blend_c: 0.0, blend_h: 0.0, clip: 1.0 };
        ModuleDefaults { params: params_bytes(&params), default_enabled: image.is_raw(), workflow_enabled: false }
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        decode::<HighlightsParams>(params).map_or_else(Vec::new, |p| vec![p.mode as f32, p.clip])
    }
}

// ========== demosaic ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct DemosaicParams {
    pub green_eq: i32,
    pub median_thrs: f32,
    pub color_smoothing: i32,
    pub method: i32,
    pub lmmse_refine: i32,
}

pub struct Demosaic;

impl IopDefinition for Demosaic {
    fn op(&self) -> &'static str {
        "demosaic"
    }

    fn name(&self) -> &'static str {
        "demosaic"
    }

    fn version(&self) -> i32 {
        4
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<DemosaicParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::ALLOW_TILING | IopFlags::ONE_INSTANCE | IopFlags::FENCE
    }

    fn hide_enable_button(&self) -> bool {
        true
    }

    fn reload_defaults(&self, image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        let params = DemosaicParams { green_eq: 0, median_thrs: 0.0, color_smoothing: 0, method: 0, lmmse_refine: 1 };
        ModuleDefaults { params: params_bytes(&params), default_enabled: image.is_raw(), workflow_enabled: false }
    }

    fn force_enable(&self, image: &ImageRecord, _current: bool) -> Option<bool> {
        Some(image.is_raw())
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        decode::<DemosaicParams>(params).map_or_else(Vec::new, |p| {
            vec![p.method as f32, p.green_eq as f32, p.median_thrs, p.color_smoothing as f32]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Workflow};
    use crate::state::data::ImageFlags;

    fn raw_with_matrix() -> ImageRecord {
        ImageRecord {
            flags: ImageFlags::RAW,
            color_matrix: Some([0.5, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.8]),
            ..Default::default()
        }
    }

    #[test]
    fn test_white_balance_adaptation() {
        let image = raw_with_matrix();
        let modern = Temperature::defaults_for(&image, ChromaticAdaptation::Modern);
        let legacy = Temperature::defaults_for(&image, ChromaticAdaptation::Legacy);
        assert_eq!(modern.preset, WB_PRESET_D65);
        assert_eq!(modern.red, 1.0);
        assert_eq!(legacy.preset, WB_PRESET_AS_SHOT);
        assert_eq!(legacy.red, 2.0);
        assert_eq!(legacy.blue, 1.25);
    }

    #[test]
    fn test_temperature_v2_migration() {
        let old = TemperatureParamsV2 { temp_out: 5000.0, coeffs: [2.0, 1.0, 1.5] };
        let migrated = Temperature.legacy_params(bytemuck::bytes_of(&old), 2).unwrap();
        let current = TemperatureParams { red: 2.0, green: 1.0, blue: 1.5, g2: 1.0, preset: WB_PRESET_USER };
        assert_eq!(Temperature.commit_params(&migrated), Temperature.commit_params(&params_bytes(&current)));
        assert!(Temperature.legacy_params(&migrated, 1).is_err());
    }

    #[test]
    fn test_rawprepare_forced_on_raw_only() {
        let env = DefaultsEnv { workflow: Workflow::SceneReferred, ..DefaultsEnv::from(&Config::default()) };
        assert_eq!(RawPrepare.force_enable(&raw_with_matrix(), false), Some(true));
        assert_eq!(RawPrepare.force_enable(&ImageRecord::default(), true), Some(false));
        assert!(RawPrepare.reload_defaults(&raw_with_matrix(), &env).default_enabled);
        assert!(!Demosaic.reload_defaults(&ImageRecord::default(), &env).default_enabled);
    }
}
