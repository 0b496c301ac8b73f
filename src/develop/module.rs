/// Processing module definitions and instances
///
/// An [`IopDefinition`] is the module software: name, parameter layout,
/// defaults and legacy migrations. An [`IopModule`] is one instance of it on
/// one image, identified by a [`ModuleId`] that history items and undo
/// snapshots refer to instead of holding pointers.

use bitflags::bitflags;
use std::sync::Arc;

use super::blend::BlendParams;
use super::masks::{self, MaskForm};
use crate::config::{ChromaticAdaptation, Config, Workflow};
use crate::error::MigrationError;
use crate::hash::ContentHasher;
use crate::state::data::ImageRecord;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IopFlags: u32 {
        const INCLUDE_IN_STYLES = 1;
        const SUPPORTS_BLENDING = 2;
        const DEPRECATED = 4;
        const ALLOW_TILING = 8;
        const HIDDEN = 16;
        const ONE_INSTANCE = 64;
        /// Never recorded in history: always at defaults
        const NO_HISTORY_STACK = 256;
        const NO_MASKS = 512;
        const FENCE = 1024;
        /// Parameters depend on the image, copying them elsewhere is wrong
        const UNSAFE_COPY = 2048;
        /// Uses drawn forms internally (not through blending)
        const INTERNAL_MASKS = 8192;
    }
}

/// Stable handle of a module instance within one develop session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

/// What default parameters may depend on besides the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultsEnv {
    pub workflow: Workflow,
    pub chromatic_adaptation: ChromaticAdaptation,
}

impl From<&Config> for DefaultsEnv {
    fn from(config: &Config) -> Self {
        Self { workflow: config.workflow, chromatic_adaptation: config.chromatic_adaptation }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDefaults {
    pub params: Vec<u8>,
    /// On for every image of this kind
    pub default_enabled: bool,
    /// On for never-edited images in the configured workflow
    pub workflow_enabled: bool,
}

pub trait IopDefinition: Send + Sync {
    /// Identifier stored in `history.operation`
    fn op(&self) -> &'static str;

    fn name(&self) -> &'static str;

    /// Version of the parameter layout
    fn version(&self) -> i32;

    fn params_size(&self) -> usize;

    fn flags(&self) -> IopFlags;

    /// The user cannot switch the module off
    fn hide_enable_button(&self) -> bool {
        false
    }

    fn reload_defaults(&self, image: &ImageRecord, env: &DefaultsEnv) -> ModuleDefaults;

    /// Upgrade parameters written by an older version.
    fn legacy_params(&self, _old: &[u8], old_version: i32) -> Result<Vec<u8>, MigrationError> {
        Err(MigrationError::Unsupported { from: old_version, to: self.version() })
    }

    /// Override the enabled state the image would otherwise get.
    /// `None` when the module has no opinion.
    fn force_enable(&self, _image: &ImageRecord, _current: bool) -> Option<bool> {
        None
    }

    /// Form ids the parameters refer to directly, for modules drawing their own shapes
    fn used_forms(&self, _params: &[u8]) -> Vec<u32> {
        Vec::new()
    }

    /// Internal processing state derived from the parameters
    fn commit_params(&self, params: &[u8]) -> Vec<f32>;
}

pub struct IopModule {
    pub id: ModuleId,
    pub so: Arc<dyn IopDefinition>,
    pub multi_priority: i32,
    pub multi_name: String,
    pub iop_order: i32,
    pub enabled: bool,
    pub default_enabled: bool,
    pub workflow_enabled: bool,
    pub hide_enable_button: bool,
    pub params: Vec<u8>,
    pub default_params: Vec<u8>,
    pub blend_params: BlendParams,
    pub default_blend_params: BlendParams,
    /// Hash of the current state, see [`IopModule::compute_hash`]
    pub hash: u64,
}

impl IopModule {
    pub fn new(id: ModuleId, so: Arc<dyn IopDefinition>) -> Self {
        let size = so.params_size();
        let hide_enable_button = so.hide_enable_button();
        Self {
            id,
            so,
            multi_priority: 0,
            multi_name: String::new(),
            iop_order: 0,
            enabled: false,
            default_enabled: false,
            workflow_enabled: false,
            hide_enable_button,
            params: vec![0; size],
            default_params: vec![0; size],
            blend_params: BlendParams::default(),
            default_blend_params: BlendParams::default(),
            hash: 0,
        }
    }

    pub fn op(&self) -> &'static str {
        self.so.op()
    }

    pub fn flags(&self) -> IopFlags {
        self.so.flags()
    }

    pub fn version(&self) -> i32 {
        self.so.version()
    }

    /// Reset parameters, blending and enabled state to the defaults for `image`.
    pub fn reload_defaults(&mut self, image: &ImageRecord, env: &DefaultsEnv) {
        let defaults = self.so.reload_defaults(image, env);
        debug_assert_eq!(defaults.params.len(), self.so.params_size());
        self.default_params = defaults.params;
        self.params.clone_from(&self.default_params);
        self.default_enabled = defaults.default_enabled;
        self.workflow_enabled = defaults.workflow_enabled;
        self.enabled = self.default_enabled;
        self.blend_params = self.default_blend_params;
    }

    /// Parameters are still the defaults
    pub fn has_defaults(&self) -> bool {
        self.params == self.default_params
    }

    /// The module's `force_enable` hook decides to switch it on
    pub fn force_enabled(&self, image: &ImageRecord) -> bool {
        self.so.force_enable(image, self.enabled) == Some(true)
    }

    /// Mandatory modules are always on and cannot be switched off by the user.
    pub fn always_on(&self) -> bool {
        self.default_enabled && self.hide_enable_button
    }

    pub fn is_hidden(&self) -> bool {
        self.flags().contains(IopFlags::HIDDEN)
    }

    pub fn leaves_no_history(&self) -> bool {
        self.flags().contains(IopFlags::NO_HISTORY_STACK)
    }

    /// History items of this module carry a copy of the drawn forms.
    pub fn includes_masks(&self) -> bool {
        let flags = self.flags();
        (flags.contains(IopFlags::SUPPORTS_BLENDING) && self.blend_params.uses_masks())
            || flags.contains(IopFlags::INTERNAL_MASKS)
    }

    /// Hash over the state that changes the module's output.
    pub fn compute_hash(&mut self, forms: &[MaskForm]) {
        let mut h = ContentHasher::new();
        h.str(self.op()).i32(self.multi_priority).bool(self.enabled);
        h.bytes(&self.params);
        if self.flags().contains(IopFlags::SUPPORTS_BLENDING) {
            h.bytes(self.blend_params.as_bytes());
            h.u64(masks::forms_hash(forms, self.blend_params.mask_id));
        }
        self.hash = h.finish();
    }

    /// Base instance on the same definition, for a new module at `multi_priority`
    pub fn duplicate_as(&self, id: ModuleId, multi_priority: i32) -> Self {
        let mut module = Self::new(id, Arc::clone(&self.so));
        module.multi_priority = multi_priority;
        module.default_enabled = self.default_enabled;
        module.workflow_enabled = self.workflow_enabled;
        module.default_params.clone_from(&self.default_params);
        module.params.clone_from(&self.default_params);
        module.default_blend_params = self.default_blend_params;
        module.blend_params = self.default_blend_params;
        module
    }
}

impl std::fmt::Debug for IopModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IopModule")
            .field("id", &self.id)
            .field("op", &self.op())
            .field("multi_priority", &self.multi_priority)
            .field("multi_name", &self.multi_name)
            .field("iop_order", &self.iop_order)
            .field("enabled", &self.enabled)
            .field("hash", &format_args!("{:#x}", self.hash))
            .finish()
    }
}

/// Modules whose parameters are not copied unless a full copy is asked for
pub fn skip_copy(flags: IopFlags) -> bool {
    flags.intersects(IopFlags::DEPRECATED | IopFlags::UNSAFE_COPY | IopFlags::HIDDEN)
}
