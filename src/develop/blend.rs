/// Blend parameters shared by every module that supports blending
///
/// The struct is stored byte-for-byte in `history.blendop_params`, so its
/// layout is part of the catalog format. Older layouts are upgraded through
/// [`BlendParams::from_legacy`].

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::error::MigrationError;

/// Current blend params layout version
pub const BLEND_VERSION: i32 = 11;

bitflags! {
    /// `mask_mode` bits. An empty set means blending is off.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MaskMode: u32 {
        const ENABLED = 1;
        const MASK = 2;
        const CONDITIONAL = 4;
        const RASTER = 8;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct BlendParams {
    pub mask_mode: u32,
    pub blend_cst: i32,
    pub blend_mode: u32,
    pub blend_parameter: f32,
    pub opacity: f32,
    pub mask_combine: u32,
    /// Drawn mask (form or group) used by this instance, 0 for none
    pub mask_id: u32,
    pub blendif: u32,
    pub feathering_radius: f32,
    pub feathering_guide: u32,
    pub blur_radius: f32,
    pub contrast: f32,
    pub brightness: f32,
    pub details: f32,
    /// Op name of the raster mask provider, NUL padded
    pub raster_mask_source: [u8; 20],
    pub raster_mask_instance: i32,
    pub raster_mask_id: i32,
    pub raster_mask_invert: i32,
    pub blendif_parameters: [f32; 16],
    pub blendif_boost_factors: [f32; 4],
}

/// Version 10 layout, before `details` was added
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct BlendParamsV10 {
    mask_mode: u32,
    blend_cst: i32,
    blend_mode: u32,
    blend_parameter: f32,
    opacity: f32,
    mask_combine: u32,
    mask_id: u32,
    blendif: u32,
    feathering_radius: f32,
    feathering_guide: u32,
    blur_radius: f32,
    contrast: f32,
    brightness: f32,
    raster_mask_source: [u8; 20],
    raster_mask_instance: i32,
    raster_mask_id: i32,
    raster_mask_invert: i32,
    blendif_parameters: [f32; 16],
    blendif_boost_factors: [f32; 4],
}

impl Default for BlendParams {
    fn default() -> Self {
        let mut blendif_parameters = [0.0; 16];
        // upper bounds of each channel's range fully open
        for pair in blendif_parameters.chunks_exact_mut(4) {
            pair[2] = 1.0;
            pair[3] = 1.0;
        }
        Self {
            mask_mode: 0,
            blend_cst: 0,
            blend_mode: 0,
            blend_parameter: 0.0,
            opacity: 100.0,
            mask_combine: 0,
            mask_id: 0,
            blendif: 0,
            feathering_radius: 0.0,
            feathering_guide: 0,
            blur_radius: 0.0,
            contrast: 0.0,
            brightness: 0.0,
            details: 0.0,
            raster_mask_source: [0; 20],
            raster_mask_instance: 0,
            raster_mask_id: 0,
            raster_mask_invert: 0,
            blendif_parameters,
            blendif_boost_factors: [0.0; 4],
        }
    }
}

impl BlendParams {
    pub const SIZE: usize = std::mem::size_of::<BlendParams>();

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode a stored blob. `None` unless it is the current version and size.
    pub fn from_bytes(bytes: &[u8], version: i32) -> Option<Self> {
        if version != BLEND_VERSION || bytes.len() != Self::SIZE {
            return None;
        }
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }

    /// Upgrade a blob written by an older layout.
    pub fn from_legacy(bytes: &[u8], version: i32) -> Result<Self, MigrationError> {
        match version {
            10 => {
                let expected = std::mem::size_of::<BlendParamsV10>();
                if bytes.len() != expected {
                    return Err(MigrationError::Length { expected, got: bytes.len() });
                }
                let old: BlendParamsV10 = bytemuck::pod_read_unaligned(bytes);
                Ok(Self {
                    mask_mode: old.mask_mode,
                    blend_cst: old.blend_cst,
                    blend_mode: old.blend_mode,
                    blend_parameter: old.blend_parameter,
                    opacity: old.opacity,
                    mask_combine: old.mask_combine,
                    mask_id: old.mask_id,
                    blendif: old.blendif,
                    feathering_radius: old.feathering_radius,
                    feathering_guide: old.feathering_guide,
                    blur_radius: old.blur_radius,
                    contrast: old.contrast,
                    brightness: old.brightness,
                    details: 0.0,
                    raster_mask_source: old.raster_mask_source,
                    raster_mask_instance: old.raster_mask_instance,
                    raster_mask_id: old.raster_mask_id,
                    raster_mask_invert: old.raster_mask_invert,
                    blendif_parameters: old.blendif_parameters,
                    blendif_boost_factors: old.blendif_boost_factors,
                })
            }
            _ => Err(MigrationError::Unsupported { from: version, to: BLEND_VERSION }),
        }
    }

    pub fn mask_flags(&self) -> MaskMode {
        MaskMode::from_bits_truncate(self.mask_mode)
    }

    /// Blending does more than switch the module on: drawn, parametric or raster masks are in use.
    pub fn uses_masks(&self) -> bool {
        self.mask_mode > MaskMode::ENABLED.bits()
    }

    /// This instance consumes a raster mask from another module
    pub fn uses_raster_mask(&self) -> bool {
        self.mask_flags().contains(MaskMode::RASTER)
    }

    pub fn raster_mask_source(&self) -> &str {
        let end = self
            .raster_mask_source
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.raster_mask_source.len());
        std::str::from_utf8(&self.raster_mask_source[..end]).unwrap_or("")
    }

    pub fn set_raster_mask_source(&mut self, op: &str) {
        self.raster_mask_source = [0; 20];
        let len = op.len().min(self.raster_mask_source.len() - 1);
        self.raster_mask_source[..len].copy_from_slice(&op.as_bytes()[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_version_roundtrip() {
        let mut params = BlendParams::default();
        params.mask_mode = (MaskMode::ENABLED | MaskMode::MASK).bits();
        params.mask_id = 42;
        let decoded = BlendParams::from_bytes(params.as_bytes(), BLEND_VERSION).unwrap();
        assert_eq!(decoded, params);
        assert!(decoded.uses_masks());
    }

    #[test]
    fn test_wrong_size_or_version_rejected() {
        let params = BlendParams::default();
        assert!(BlendParams::from_bytes(&params.as_bytes()[4..], BLEND_VERSION).is_none());
        assert!(BlendParams::from_bytes(params.as_bytes(), 10).is_none());
    }

    #[test]
    fn test_v10_migration() {
        let mut old = BlendParamsV10::zeroed();
        old.opacity = 55.0;
        old.mask_id = 7;
        old.blendif_parameters[3] = 1.0;
        let migrated = BlendParams::from_legacy(bytemuck::bytes_of(&old), 10).unwrap();
        assert_eq!(migrated.opacity, 55.0);
        assert_eq!(migrated.mask_id, 7);
        assert_eq!(migrated.details, 0.0);
        assert_eq!(migrated.blendif_parameters[3], 1.0);

        assert_eq!(
            BlendParams::from_legacy(&[0u8; 12], 10),
            Err(MigrationError::Length { expected: std::mem::size_of::<BlendParamsV10>(), got: 12 })
        );
        assert_eq!(
            BlendParams::from_legacy(&[], 3),
            Err(MigrationError::Unsupported { from: 3, to: BLEND_VERSION })
        );
    }

    #[test]
    fn test_raster_mask_source() {
        let mut params = BlendParams::default();
        params.set_raster_mask_source("exposure");
        assert_eq!(params.raster_mask_source(), "exposure");
        assert!(!params.uses_raster_mask());
        params.mask_mode = (MaskMode::ENABLED | MaskMode::RASTER).bits();
        assert!(params.uses_raster_mask());
    }
}
