/// Denoise, orientation, retouch, exposure and the mask manager

use bytemuck::{Pod, Zeroable};

use super::{decode, migrate, params_bytes};
use crate::config::Workflow;
use crate::develop::module::{DefaultsEnv, IopDefinition, IopFlags, ModuleDefaults};
use crate::error::MigrationError;
use crate::state::data::ImageRecord;

// ========== denoiseprofile ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct DenoiseProfileParams {
    pub radius: f32,
    pub nbhood: f32,
    pub strength: f32,
    /// Poissonian noise per channel
    pub a: [f32; 3],
    /// Gaussian noise per channel
    pub b: [f32; 3],
    pub mode: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct DenoiseProfileParamsV1 {
    pub radius: f32,
    pub strength: f32,
    pub a: [f32; 3],
    pub b: [f32; 3],
}

pub struct DenoiseProfile;

impl IopDefinition for DenoiseProfile {
    fn op(&self) -> &'static str {
        "denoiseprofile"
    }

    fn name(&self) -> &'static str {
        "denoise (profiled)"
    }

    fn version(&self) -> i32 {
        3
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<DenoiseProfileParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::SUPPORTS_BLENDING | IopFlags::ALLOW_TILING | IopFlags::INCLUDE_IN_STYLES
    }

    fn reload_defaults(&self, _image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        let params = DenoiseProfileParams {
            radius: 1.0,
            nbhood: 7.0,
            strength: 1.0,
            a: [1e-4; 3],
            b: [1e-6; 3],
            mode: 0,
        };
        ModuleDefaults { params: params_bytes(&params), default_enabled: false, workflow_enabled: false }
    }

    fn legacy_params(&self, old: &[u8], old_version: i32) -> Result<Vec<u8>, MigrationError> {
        match old_version {
            // v1 always used non-local means with the default patch neighbourhood
            1 => migrate(old, |o: DenoiseProfileParamsV1| DenoiseProfileParams {
                radius: o.radius,
                nbhood: 7.0,
                strength: o.strength,
                a: o.a,
                b: o.b,
                mode: 0,
            }),
            _ => Err(MigrationError::Unsupported { from: old_version, to: self.version() }),
        }
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        let Some(p) = decode::<DenoiseProfileParams>(params) else {
            return Vec::new();
        };
        let mut state = vec![p.radius, p.nbhood, p.strength, p.mode as f32];
        state.extend_from_slice(&p.a);
        state.extend_from_slice(&p.b);
        state
    }
}

// ========== flip ==========

/// Take the orientation from the image
pub const ORIENTATION_AUTO: i32 = -1;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct FlipParams {
    pub orientation: i32,
}

pub struct Flip;

impl IopDefinition for Flip {
    fn op(&self) -> &'static str {
        "flip"
    }

    fn name(&self) -> &'static str {
        "orientation"
    }

    fn version(&self) -> i32 {
        2
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<FlipParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::ALLOW_TILING | IopFlags::ONE_INSTANCE | IopFlags::UNSAFE_COPY
    }

    fn reload_defaults(&self, _image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        ModuleDefaults {
            params: params_bytes(&FlipParams { orientation: ORIENTATION_AUTO }),
            default_enabled: true,
            workflow_enabled: false,
        }
    }

    /// v1 stored 0 for "as shot"
    fn legacy_params(&self, old: &[u8], old_version: i32) -> Result<Vec<u8>, MigrationError> {
        match old_version {
            1 => migrate(old, |o: FlipParams| FlipParams {
                orientation: if o.orientation == 0 { ORIENTATION_AUTO } else { o.orientation },
            }),
            _ => Err(MigrationError::Unsupported { from: old_version, to: self.version() }),
        }
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        decode::<FlipParams>(params).map_or_else(Vec::new, |p| vec![p.orientation as f32])
    }
}

// ========== spots ==========

pub const MAX_SPOTS: usize = 32;

pub const SPOT_ALGO_CLONE: i32 = 1;
pub const SPOT_ALGO_HEAL: i32 = 2;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SpotsParams {
    /// Form ids of the clone shapes, 0 for unused slots
    pub clone_id: [i32; MAX_SPOTS],
    pub clone_algo: [i32; MAX_SPOTS],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SpotsParamsV1 {
    pub clone_id: [i32; MAX_SPOTS],
}

pub struct Spots;

impl IopDefinition for Spots {
    fn op(&self) -> &'static str {
        "spots"
    }

    fn name(&self) -> &'static str {
        "spot removal"
    }

    fn version(&self) -> i32 {
        2
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<SpotsParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::SUPPORTS_BLENDING | IopFlags::NO_MASKS | IopFlags::INTERNAL_MASKS
    }

    fn reload_defaults(&self, _image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        ModuleDefaults { params: params_bytes(&SpotsParams::zeroed()), default_enabled: false, workflow_enabled: false }
    }

    /// v1 only knew healing
    fn legacy_params(&self, old: &[u8], old_version: i32) -> Result<Vec<u8>, MigrationError> {
        match old_version {
            1 => migrate(old, |o: SpotsParamsV1| {
                let mut clone_algo = [0; MAX_SPOTS];
                for (algo, &id) in clone_algo.iter_mut().zip(o.clone_id.iter()) {
                    if id > 0 {
                        *algo = SPOT_ALGO_HEAL;
                    }
                }
                SpotsParams { clone_id: o.clone_id, clone_algo }
            }),
            _ => Err(MigrationError::Unsupported { from: old_version, to: self.version() }),
        }
    }

    fn used_forms(&self, params: &[u8]) -> Vec<u32> {
        decode::<SpotsParams>(params).map_or_else(Vec::new, |p| {
            p.clone_id.iter().filter(|&&id| id > 0).map(|&id| id as u32).collect()
        })
    }

    /// `[spot count, algo of each used slot...]`
    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        let Some(p) = decode::<SpotsParams>(params) else {
            return Vec::new();
        };
        let used: Vec<f32> = p
            .clone_id
            .iter()
            .zip(p.clone_algo.iter())
            .filter(|(&id, _)| id > 0)
            .map(|(_, &algo)| algo as f32)
            .collect();
        let mut state = vec![used.len() as f32];
        state.extend(used);
        state
    }
}

// ========== exposure ==========

pub const EXPOSURE_MODE_MANUAL: i32 = 0;
pub const EXPOSURE_MODE_DEFLICKER: i32 = 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ExposureParams {
    pub mode: i32,
    pub black: f32,
    /// EV
    pub exposure: f32,
    pub deflicker_percentile: f32,
    pub deflicker_target_level: f32,
    pub compensate_exposure_bias: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ExposureParamsV5 {
    pub mode: i32,
    pub black: f32,
    pub exposure: f32,
    pub deflicker_percentile: f32,
    pub deflicker_target_level: f32,
}

pub struct Exposure;

impl IopDefinition for Exposure {
    fn op(&self) -> &'static str {
        "exposure"
    }

    fn name(&self) -> &'static str {
        "exposure"
    }

    fn version(&self) -> i32 {
        6
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<ExposureParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::SUPPORTS_BLENDING | IopFlags::ALLOW_TILING | IopFlags::INCLUDE_IN_STYLES
    }

    fn reload_defaults(&self, image: &ImageRecord, env: &DefaultsEnv) -> ModuleDefaults {
        let scene_referred = env.workflow == Workflow::SceneReferred && image.is_raw();
        let params = ExposureParams {
            mode: EXPOSURE_MODE_MANUAL,
            black: if scene_referred { -0.000244140625 } else { 0.0 },
            exposure: if scene_referred { 0.7 } else { 0.0 },
            deflicker_percentile: 50.0,
            deflicker_target_level: -4.0,
            compensate_exposure_bias: i32::from(scene_referred),
        };
        ModuleDefaults { params: params_bytes(&params), default_enabled: false, workflow_enabled: scene_referred }
    }

    fn legacy_params(&self, old: &[u8], old_version: i32) -> Result<Vec<u8>, MigrationError> {
        match old_version {
            5 => migrate(old, |o: ExposureParamsV5| ExposureParams {
                mode: o.mode,
                black: o.black,
                exposure: o.exposure,
                deflicker_percentile: o.deflicker_percentile,
                deflicker_target_level: o.deflicker_target_level,
                compensate_exposure_bias: 0,
            }),
            _ => Err(MigrationError::Unsupported { from: old_version, to: self.version() }),
        }
    }

    /// `[black, scale]` of the linear mapping the module applies
    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        let Some(p) = decode::<ExposureParams>(params) else {
            return Vec::new();
        };
        let white = (-p.exposure).exp2();
        let scale = 1.0 / (white - p.black);
        vec![p.black, scale]
    }
}

// ========== mask_manager ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MaskManagerParams {
    pub dummy: i32,
}

/// Never processes pixels; its history items record drawn-mask edits.
pub struct MaskManager;

impl IopDefinition for MaskManager {
    fn op(&self) -> &'static str {
        "mask_manager"
    }

    fn name(&self) -> &'static str {
        "mask manager"
    }

    fn version(&self) -> i32 {
        1
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<MaskManagerParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::HIDDEN | IopFlags::ONE_INSTANCE | IopFlags::INTERNAL_MASKS
    }

    fn reload_defaults(&self, _image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        ModuleDefaults {
            params: params_bytes(&MaskManagerParams::zeroed()),
            default_enabled: false,
            workflow_enabled: false,
        }
    }

    fn commit_params(&self, _params: &[u8]) -> Vec<f32> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::data::ImageFlags;

    #[test]
    fn test_exposure_v5_migration_keeps_processing() {
        let old = ExposureParamsV5 {
            mode: EXPOSURE_MODE_MANUAL,
            black: 0.01,
            exposure: 1.5,
            deflicker_percentile: 50.0,
            deflicker_target_level: -4.0,
        };
        let migrated = Exposure.legacy_params(bytemuck::bytes_of(&old), 5).unwrap();
        let expected = ExposureParams {
            mode: EXPOSURE_MODE_MANUAL,
            black: 0.01,
            exposure: 1.5,
            deflicker_percentile: 50.0,
            deflicker_target_level: -4.0,
            compensate_exposure_bias: 0,
        };
        assert_eq!(decode::<ExposureParams>(&migrated), Some(expected));
        assert_eq!(Exposure.commit_params(&migrated), Exposure.commit_params(&params_bytes(&expected)));
        assert_eq!(
            Exposure.legacy_params(&migrated, 4),
            Err(MigrationError::Unsupported { from: 4, to: 6 })
        );
    }

    #[test]
    fn test_exposure_workflow_default() {
        let raw = ImageRecord { flags: ImageFlags::RAW, ..Default::default() };
        let mut env = DefaultsEnv::from(&Config::default());
        assert!(Exposure.reload_defaults(&raw, &env).workflow_enabled);
        env.workflow = Workflow::DisplayReferred;
        assert!(!Exposure.reload_defaults(&raw, &env).workflow_enabled);
    }

    #[test]
    fn test_denoise_v1_migration() {
        let old = DenoiseProfileParamsV1 { radius: 2.0, strength: 0.5, a: [1.0, 2.0, 3.0], b: [4.0, 5.0, 6.0] };
        let migrated = DenoiseProfile.legacy_params(bytemuck::bytes_of(&old), 1).unwrap();
        let state = DenoiseProfile.commit_params(&migrated);
        assert_eq!(state, vec![2.0, 7.0, 0.5, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_spots_v1_migration() {
        let mut old = SpotsParamsV1::zeroed();
        old.clone_id[0] = 12;
        old.clone_id[1] = 13;
        let migrated = Spots.legacy_params(bytemuck::bytes_of(&old), 1).unwrap();
        assert_eq!(Spots.commit_params(&migrated), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_flip_v1_migration() {
        let migrated = Flip.legacy_params(bytemuck::bytes_of(&FlipParams { orientation: 0 }), 1).unwrap();
        assert_eq!(decode::<FlipParams>(&migrated), Some(FlipParams { orientation: ORIENTATION_AUTO }));
        let migrated = Flip.legacy_params(bytemuck::bytes_of(&FlipParams { orientation: 5 }), 1).unwrap();
        assert_eq!(decode::<FlipParams>(&migrated), Some(FlipParams { orientation: 5 }));
    }
}
