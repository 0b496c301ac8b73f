/// Shared handles of the history subsystem
///
/// One `Context` is built at startup and cloned into every develop session
/// and lighttable operation. Tests build their own over an in-memory store.

use std::sync::Arc;
use tokio::runtime::Handle;

use crate::cache::image_cache::ImageCache;
use crate::config::Config;
use crate::control::jobs::SidecarWriter;
use crate::control::signals::SignalBus;
use crate::control::undo::UndoStack;
use crate::develop::module::DefaultsEnv;
use crate::error::StoreError;
use crate::iop::ModuleRegistry;
use crate::state::library::Library;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub library: Arc<Library>,
    pub image_cache: Arc<ImageCache>,
    pub registry: Arc<ModuleRegistry>,
    pub undo: Arc<UndoStack>,
    pub signals: Arc<SignalBus>,
}

impl Context {
    /// Wire the cache, registry, undo stack and signal bus around `library`.
    pub fn new(config: Config, library: Arc<Library>) -> Self {
        let image_cache = Arc::new(ImageCache::new(
            Arc::clone(&library),
            config.image_cache_bytes(),
            config.write_sidecar_files,
        ));
        let signals = Arc::new(SignalBus::new());
        ImageCache::connect_info_changed_first(&signals, &image_cache);

        Self {
            config: Arc::new(config),
            library,
            image_cache,
            registry: Arc::new(ModuleRegistry::builtin()),
            undo: Arc::new(UndoStack::new()),
            signals,
        }
    }

    /// Open the configured catalog, creating it when needed.
    pub fn open(config: Config) -> Result<Self, StoreError> {
        let path = config.database_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let library = Library::open(&path)?;
        tracing::info!("opened catalog at {}", path.display());
        Ok(Self::new(config, Arc::new(library)))
    }

    /// Start the sidecar worker on `handle` and hand it to the image cache.
    pub fn start_sidecar_writer(&self, handle: &Handle) -> SidecarWriter {
        let writer = SidecarWriter::start(handle, Arc::clone(&self.library), self.config.sidecar_queue_capacity);
        self.image_cache.set_sidecar_writer(writer.clone());
        writer
    }

    pub fn defaults_env(&self) -> DefaultsEnv {
        DefaultsEnv::from(self.config.as_ref())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("image_cache", &self.image_cache)
            .field("registry", &self.registry)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::signals::{Signal, SignalKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cache_reloads_before_other_listeners() {
        let ctx = fixture::context();
        let imgid = fixture::add_raw(&ctx);
        assert!(ctx.image_cache.read(imgid).is_some());

        // change the row behind the cache's back
        ctx.library.set_color_labels(imgid, 0b100).unwrap();
        let mut img = ctx.library.load_image(imgid).unwrap().unwrap();
        img.orientation = 3;
        ctx.library.update_image(&img).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let cache = Arc::clone(&ctx.image_cache);
        let seen_in_handler = Arc::clone(&seen);
        ctx.signals.connect(SignalKind::ImageInfoChanged, move |_| {
            let img = cache.read(imgid).unwrap();
            seen_in_handler.store(img.orientation as usize, Ordering::SeqCst);
        });
        ctx.signals.raise(Signal::ImageInfoChanged(vec![imgid]));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_defaults_env_follows_config() {
        let config = Config { workflow: crate::config::Workflow::DisplayReferred, ..Config::default() };
        let ctx = fixture::context_with(config);
        assert_eq!(ctx.defaults_env().workflow, crate::config::Workflow::DisplayReferred);
    }
}
