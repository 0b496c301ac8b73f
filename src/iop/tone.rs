/// Tone curves and color management

use bytemuck::{Pod, Zeroable};

use super::{decode, params_bytes};
use crate::config::Workflow;
use crate::develop::module::{DefaultsEnv, IopDefinition, IopFlags, ModuleDefaults};
use crate::state::data::ImageRecord;

pub const MAX_CURVE_NODES: usize = 8;

/// Evaluate a piecewise linear curve at `x`; `points` are `(x, y)` pairs sorted by x.
fn eval_curve(points: &[f32], nodes: usize, x: f32) -> f32 {
    let nodes = nodes.clamp(1, MAX_CURVE_NODES);
    let point = |i: usize| (points[2 * i], points[2 * i + 1]);
    let (first_x, first_y) = point(0);
    if x <= first_x {
        return first_y;
    }
    for i in 1..nodes {
        let (x0, y0) = point(i - 1);
        let (x1, y1) = point(i);
        if x <= x1 {
            let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
            return y0 + t * (y1 - y0);
        }
    }
    point(nodes - 1).1
}

/// 16-entry lookup of the curve, the state both curve modules hand to the pipe
fn curve_lut(points: &[f32], nodes: i32) -> Vec<f32> {
    let nodes = nodes.max(1) as usize;
    (0..16).map(|i| eval_curve(points, nodes, i as f32 / 15.0)).collect()
}

fn identity_points() -> [f32; 2 * MAX_CURVE_NODES] {
    let mut points = [0.0; 2 * MAX_CURVE_NODES];
    points[2] = 1.0;
    points[3] = 1.0;
    points
}

// ========== basecurve ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct BaseCurveParams {
    pub preset: i32,
    /// `(x, y)` nodes
    pub points: [f32; 2 * MAX_CURVE_NODES],
    pub num_nodes: i32,
    pub exposure_fusion: i32,
    pub exposure_stops: f32,
}

pub struct BaseCurve;

impl IopDefinition for BaseCurve {
    fn op(&self) -> &'static str {
        "basecurve"
    }

    fn name(&self) -> &'static str {
        "base curve"
    }

    fn version(&self) -> i32 {
        6
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<BaseCurveParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::SUPPORTS_BLENDING | IopFlags::ALLOW_TILING | IopFlags::INCLUDE_IN_STYLES
    }

    fn reload_defaults(&self, image: &ImageRecord, env: &DefaultsEnv) -> ModuleDefaults {
        // gentle film-like shoulder
        let mut points = identity_points();
        points[2] = 0.5;
        points[3] = 0.6;
        points[4] = 1.0;
        points[5] = 1.0;
        let params = BaseCurveParams { preset: 0, points, num_nodes: 3, exposure_fusion: 0, exposure_stops: 1.0 };
        ModuleDefaults {
            params: params_bytes(&params),
            default_enabled: false,
            workflow_enabled: env.workflow == Workflow::DisplayReferred && image.is_raw(),
        }
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        decode::<BaseCurveParams>(params).map_or_else(Vec::new, |p| curve_lut(&p.points, p.num_nodes))
    }
}

// ========== colorin ==========

pub const PROFILE_SRGB: i32 = 1;
pub const PROFILE_STANDARD_MATRIX: i32 = 2;
pub const PROFILE_LIN_REC2020: i32 = 3;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ColorInParams {
    pub profile: i32,
    pub working_profile: i32,
    pub intent: i32,
    pub normalize: i32,
    pub blue_mapping: i32,
}

pub struct ColorIn;

impl IopDefinition for ColorIn {
    fn op(&self) -> &'static str {
        "colorin"
    }

    fn name(&self) -> &'static str {
        "input color profile"
    }

    fn version(&self) -> i32 {
        7
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<ColorInParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::ALLOW_TILING | IopFlags::ONE_INSTANCE | IopFlags::UNSAFE_COPY
    }

    fn hide_enable_button(&self) -> bool {
        true
    }

    fn reload_defaults(&self, image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        let profile = if image.is_matrix_correction_supported() { PROFILE_STANDARD_MATRIX } else { PROFILE_SRGB };
        let params = ColorInParams {
            profile,
            working_profile: PROFILE_LIN_REC2020,
            intent: 0,
            normalize: 0,
            blue_mapping: i32::from(image.is_raw()),
        };
        ModuleDefaults { params: params_bytes(&params), default_enabled: true, workflow_enabled: false }
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        decode::<ColorInParams>(params).map_or_else(Vec::new, |p| {
            vec![p.profile as f32, p.working_profile as f32, p.intent as f32]
        })
    }
}

// ========== tonecurve ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ToneCurveParams {
    pub points: [f32; 2 * MAX_CURVE_NODES],
    pub num_nodes: i32,
    pub autoscale: i32,
    pub preserve_colors: i32,
}

pub struct ToneCurve;

impl IopDefinition for ToneCurve {
    fn op(&self) -> &'static str {
        "tonecurve"
    }

    fn name(&self) -> &'static str {
        "tone curve"
    }

    fn version(&self) -> i32 {
        5
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<ToneCurveParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::SUPPORTS_BLENDING | IopFlags::ALLOW_TILING | IopFlags::INCLUDE_IN_STYLES
    }

    fn reload_defaults(&self, _image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        let params = ToneCurveParams { points: identity_points(), num_nodes: 2, autoscale: 1, preserve_colors: 1 };
        ModuleDefaults { params: params_bytes(&params), default_enabled: false, workflow_enabled: false }
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        decode::<ToneCurveParams>(params).map_or_else(Vec::new, |p| curve_lut(&p.points, p.num_nodes))
    }
}

// ========== colorout ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ColorOutParams {
    pub profile: i32,
    pub intent: i32,
}

pub struct ColorOut;

impl IopDefinition for ColorOut {
    fn op(&self) -> &'static str {
        "colorout"
    }

    fn name(&self) -> &'static str {
        "output color profile"
    }

    fn version(&self) -> i32 {
        5
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<ColorOutParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::ALLOW_TILING | IopFlags::ONE_INSTANCE | IopFlags::UNSAFE_COPY
    }

    fn hide_enable_button(&self) -> bool {
        true
    }

    fn reload_defaults(&self, _image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        let params = ColorOutParams { profile: PROFILE_SRGB, intent: 0 };
        ModuleDefaults { params: params_bytes(&params), default_enabled: true, workflow_enabled: false }
    }

    fn commit_params(&self, params: &[u8]) -> Vec<f32> {
        decode::<ColorOutParams>(params).map_or_else(Vec::new, |p| vec![p.profile as f32, p.intent as f32])
    }
}

// ========== gamma ==========

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct GammaParams {
    pub dummy: i32,
}

/// Display encoding at the end of the pipe. Always on, never in history.
pub struct Gamma;

impl IopDefinition for Gamma {
    fn op(&self) -> &'static str {
        "gamma"
    }

    fn name(&self) -> &'static str {
        "display encoding"
    }

    fn version(&self) -> i32 {
        1
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<GammaParams>()
    }

    fn flags(&self) -> IopFlags {
        IopFlags::HIDDEN | IopFlags::ONE_INSTANCE | IopFlags::NO_HISTORY_STACK | IopFlags::UNSAFE_COPY
    }

    fn hide_enable_button(&self) -> bool {
        true
    }

    fn reload_defaults(&self, _image: &ImageRecord, _env: &DefaultsEnv) -> ModuleDefaults {
        ModuleDefaults { params: params_bytes(&GammaParams::zeroed()), default_enabled: true, workflow_enabled: false }
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
    fn test_identity_curve() {
        let env = DefaultsEnv::from(&Config::default());
        let defaults = ToneCurve.reload_defaults(&ImageRecord::default(), &env);
        let lut = ToneCurve.commit_params(&defaults.params);
        assert_eq!(lut.len(), 16);
        for (i, v) in lut.iter().enumerate() {
            assert!((v - i as f32 / 15.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_basecurve_is_display_referred() {
        let raw = ImageRecord { flags: ImageFlags::RAW, ..Default::default() };
        let mut env = DefaultsEnv::from(&Config::default());
        assert!(!BaseCurve.reload_defaults(&raw, &env).workflow_enabled);
        env.workflow = Workflow::DisplayReferred;
        assert!(BaseCurve.reload_defaults(&raw, &env).workflow_enabled);
        let lut = BaseCurve.commit_params(&BaseCurve.reload_defaults(&raw, &env).params);
        assert!((lut[15] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_gamma_has_no_history() {
        assert!(Gamma.flags().contains(IopFlags::NO_HISTORY_STACK));
        assert!(Gamma.hide_enable_button());
    }
}
