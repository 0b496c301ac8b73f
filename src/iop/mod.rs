/// Built-in processing modules
///
/// Only what the history engine needs from a module lives here: parameter
/// layout and version, flags, defaults, legacy migrations, and the internal
/// state derived from parameters. Pixel processing is not part of this crate.
///
/// - Raw preparation and white balance (raw.rs)
/// - Corrections: denoise, orientation, retouch, exposure (correct.rs)
/// - Tone and color management (tone.rs)

pub mod correct;
pub mod raw;
pub mod tone;

use bytemuck::Pod;
use std::sync::Arc;

use crate::develop::iop_order::PIPELINE_ORDER;
use crate::develop::module::IopDefinition;
use crate::error::MigrationError;

/// Every module definition the engine can resolve history items against
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn IopDefinition>>,
}

impl ModuleRegistry {
    pub fn new(modules: Vec<Arc<dyn IopDefinition>>) -> Self {
        Self { modules }
    }

    /// All built-in modules, in pipeline order
    pub fn builtin() -> Self {
        let mut modules: Vec<Arc<dyn IopDefinition>> = vec![
            Arc::new(raw::RawPrepare),
            Arc::new(raw::Temperature),
            Arc::new(raw::Highlights),
            Arc::new(raw::Demosaic),
            Arc::new(correct::DenoiseProfile),
            Arc::new(correct::Flip),
            Arc::new(correct::Spots),
            Arc::new(correct::Exposure),
            Arc::new(correct::MaskManager),
            Arc::new(tone::BaseCurve),
            Arc::new(tone::ColorIn),
            Arc::new(tone::ToneCurve),
            Arc::new(tone::ColorOut),
            Arc::new(tone::Gamma),
        ];
        modules.sort_by_key(|m| PIPELINE_ORDER.iter().position(|op| *op == m.op()));
        Self::new(modules)
    }

    pub fn get(&self, op: &str) -> Option<Arc<dyn IopDefinition>> {
        self.modules.iter().find(|m| m.op() == op).map(Arc::clone)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn IopDefinition>> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.modules.iter().map(|m| m.op())).finish()
    }
}

pub(crate) fn params_bytes<P: Pod>(params: &P) -> Vec<u8> {
    bytemuck::bytes_of(params).to_vec()
}

pub(crate) fn decode<P: Pod>(bytes: &[u8]) -> Option<P> {
    bytemuck::try_pod_read_unaligned(bytes).ok()
}

/// Read an old layout and upgrade it with `upgrade`.
pub(crate) fn migrate<Old: Pod, New: Pod>(
    old: &[u8],
    upgrade: impl FnOnce(Old) -> New,
) -> Result<Vec<u8>, MigrationError> {
    let expected = std::mem::size_of::<Old>();
    if old.len() != expected {
        return Err(MigrationError::Length { expected, got: old.len() });
    }
    let old: Old = bytemuck::pod_read_unaligned(old);
    Ok(params_bytes(&upgrade(old)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = ModuleRegistry::builtin();
        assert_eq!(registry.len(), PIPELINE_ORDER.len());
        let ops: Vec<&str> = registry.iter().map(|m| m.op()).collect();
        assert_eq!(ops, PIPELINE_ORDER.to_vec());
        assert!(registry.get("exposure").is_some());
        assert!(registry.get("liquify").is_none());
    }

    #[test]
    fn test_migrate_checks_length() {
        let err = migrate::<[i32; 2], [i32; 3]>(&[0u8; 4], |old| [old[0], old[1], 0]).unwrap_err();
        assert_eq!(err, MigrationError::Length { expected: 8, got: 4 });

        let bytes = params_bytes(&[1i32, 2]);
        let new = migrate::<[i32; 2], [i32; 3]>(&bytes, |old| [old[0], old[1], 3]).unwrap();
        assert_eq!(decode::<[i32; 3]>(&new), Some([1, 2, 3]));
    }

    #[test]
    fn test_every_default_has_the_declared_size() {
        let registry = ModuleRegistry::builtin();
        let env = crate::develop::module::DefaultsEnv::from(&crate::config::Config::default());
        let image = crate::state::data::ImageRecord::default();
        for module in registry.iter() {
            let defaults = module.reload_defaults(&image, &env);
            assert_eq!(defaults.params.len(), module.params_size(), "{}", module.op());
        }
    }
}
