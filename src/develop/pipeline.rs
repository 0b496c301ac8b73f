/// Pipeline binding
///
/// The renderer itself lives elsewhere; what the history engine owns is the
/// node list each pipe renders from and the signals that keep it in step:
/// - `rebuild`: the set of nodes changed, start over
/// - `resync`: same nodes, every parameter committed again
/// - `update`: same nodes, only the nodes whose hash moved
///
/// Every history mutation raises the shutdown flag first, so a pass still
/// running on the old state gives up and reports [`ProcessOutcome::Dirty`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::module::{IopModule, ModuleId};
use super::Develop;
use crate::hash::ContentHasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Full,
    Preview,
}

/// One enabled module instance as the renderer sees it
#[derive(Debug, Clone, PartialEq)]
pub struct PipeNode {
    pub module: ModuleId,
    pub op: &'static str,
    pub multi_priority: i32,
    pub iop_order: i32,
    pub hash: u64,
    /// Output of the module's `commit_params`
    pub state: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Rendered state, identified by the fold of the node hashes
    Done { hash: u64 },
    /// Cancelled by a history change; run again
    Dirty,
}

/// Signal counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub rebuilds: u32,
    pub resyncs: u32,
    pub updates: u32,
}

#[derive(Debug)]
pub struct HeadlessPipe {
    kind: PipeKind,
    nodes: Vec<PipeNode>,
    shutdown: Arc<AtomicBool>,
    /// History hash the nodes were last synced from
    history_hash: u64,
    stats: PipeStats,
}

impl HeadlessPipe {
    pub fn new(kind: PipeKind) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            history_hash: 0,
            stats: PipeStats::default(),
        }
    }

    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    pub fn nodes(&self) -> &[PipeNode] {
        &self.nodes
    }

    pub fn stats(&self) -> PipeStats {
        self.stats
    }

    pub fn history_hash(&self) -> u64 {
        self.history_hash
    }

    /// Flag a worker thread can poll while processing
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Mirror the enabled modules, in pipeline order.
    fn sync(&mut self, modules: &[IopModule]) {
        self.nodes = modules.iter().filter(|m| m.enabled).map(node_for).collect();
    }

    /// Drop every node and build them again from `modules`.
    pub fn rebuild(&mut self, modules: &[IopModule], history_hash: u64) {
        self.sync(modules);
        self.history_hash = history_hash;
        self.stats.rebuilds += 1;
        self.shutdown.store(false, Ordering::Release);
    }

    /// Commit every node again. A raster-mask consumer's hash also covers
    /// its provider, so both change together.
    pub fn resync(&mut self, modules: &[IopModule], history_hash: u64) {
        self.sync(modules);
        for i in 0..self.nodes.len() {
            let Some(module) = modules.iter().find(|m| m.id == self.nodes[i].module) else {
                continue;
            };
            if !module.blend_params.uses_raster_mask() {
                continue;
            }
            let source = module.blend_params.raster_mask_source();
            let instance = module.blend_params.raster_mask_instance;
            if let Some(provider) =
                self.nodes.iter().find(|n| n.op == source && n.multi_priority == instance).map(|n| n.hash)
            {
                let mut h = ContentHasher::new();
                h.u64(self.nodes[i].hash);
                h.u64(provider);
                self.nodes[i].hash = h.finish();
            }
        }
        self.history_hash = history_hash;
        self.stats.resyncs += 1;
        self.shutdown.store(false, Ordering::Release);
    }

    /// Commit only the nodes whose module changed. Callers raise a rebuild
    /// for a new node; a node set that still differs here is rebuilt too.
    pub fn update(&mut self, modules: &[IopModule], history_hash: u64) {
        let enabled: Vec<&IopModule> = modules.iter().filter(|m| m.enabled).collect();
        let same_topology = enabled.len() == self.nodes.len()
            && enabled.iter().zip(&self.nodes).all(|(m, n)| m.id == n.module);
        if !same_topology {
            tracing::warn!("[pipe {:?}] node set changed under an update, rebuilding", self.kind);
            self.rebuild(modules, history_hash);
            return;
        }
        for (module, node) in enabled.into_iter().zip(self.nodes.iter_mut()) {
            if node.hash != module.hash {
                *node = node_for(module);
            }
        }
        self.history_hash = history_hash;
        self.stats.updates += 1;
        self.shutdown.store(false, Ordering::Release);
    }

    /// Run one pass over the nodes.
    pub fn process(&self) -> ProcessOutcome {
        let mut h = ContentHasher::new();
        for node in &self.nodes {
            if self.shutdown.load(Ordering::Acquire) {
                return ProcessOutcome::Dirty;
            }
            h.u64(node.hash);
        }
        if self.shutdown.load(Ordering::Acquire) {
            return ProcessOutcome::Dirty;
        }
        ProcessOutcome::Done { hash: h.finish() }
    }
}

fn node_for(module: &IopModule) -> PipeNode {
    PipeNode {
        module: module.id,
        op: module.op(),
        multi_priority: module.multi_priority,
        iop_order: module.iop_order,
        hash: module.hash,
        state: module.so.commit_params(&module.params),
    }
}

impl Develop {
    /// Stop running passes before the history changes under them.
    pub(crate) fn pipes_shutdown(&self) {
        self.full_pipe.request_shutdown();
        self.preview_pipe.request_shutdown();
    }

    pub fn pipeline_update_history_all(&mut self) {
        let hash = self.get_hash();
        self.full_pipe.update(&self.iop, hash);
        self.preview_pipe.update(&self.iop, hash);
    }

    pub fn pipeline_resync_history_all(&mut self) {
        let hash = self.get_hash();
        self.full_pipe.resync(&self.iop, hash);
        self.preview_pipe.resync(&self.iop, hash);
    }

    pub fn pipeline_rebuild_all(&mut self) {
        let hash = self.get_hash();
        self.full_pipe.rebuild(&self.iop, hash);
        self.preview_pipe.rebuild(&self.iop, hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixture;
    use crate::state::data::ImageFlags;

    #[test]
    fn test_nodes_follow_enabled_modules() {
        let ctx = fixture::context();
        let imgid = fixture::add_raw(&ctx);
        let dev = Develop::load(ctx, imgid).unwrap();

        let enabled: Vec<ModuleId> = dev.iop.iter().filter(|m| m.enabled).map(|m| m.id).collect();
        let nodes: Vec<ModuleId> = dev.full_pipe.nodes().iter().map(|n| n.module).collect();
        assert_eq!(nodes, enabled);
        assert!(dev.full_pipe.nodes().windows(2).all(|w| w[0].iop_order < w[1].iop_order));
        assert_eq!(dev.full_pipe.stats().rebuilds, 1);
        assert_eq!(dev.preview_pipe.kind(), PipeKind::Preview);
    }

    #[test]
    fn test_plain_edit_is_an_update() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "p.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx, imgid).unwrap();

        let colorin = dev.find_module("colorin", 0).unwrap().id;
        assert!(dev.module(colorin).unwrap().enabled);
        let before = dev.full_pipe.stats();
        assert!(!dev.add_history_item(colorin, true).unwrap());
        let stats = dev.full_pipe.stats();
        assert_eq!(stats.updates, before.updates + 1);
        assert_eq!(stats.resyncs, before.resyncs);
        assert_eq!(stats.rebuilds, before.rebuilds);
        assert_eq!(dev.full_pipe.history_hash(), dev.get_hash());
    }

    #[test]
    fn test_enabling_a_module_rebuilds() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "q.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx, imgid).unwrap();

        let exposure = dev.find_module("exposure", 0).unwrap().id;
        assert!(!dev.module(exposure).unwrap().enabled);
        assert!(dev.add_history_item(exposure, true).unwrap());
        assert_eq!(dev.full_pipe.stats().rebuilds, 2);
        assert_eq!(dev.full_pipe.stats().updates, 0);
        assert!(dev.full_pipe.nodes().iter().any(|n| n.module == exposure));
    }

    #[test]
    fn test_failed_store_write_leaves_pipes_alone() {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "r.jpg", ImageFlags::LDR);
        let mut dev = Develop::load(ctx.clone(), imgid).unwrap();
        ctx.library
            .conn()
            .execute_batch(
                "CREATE TRIGGER history_locked BEFORE INSERT ON history
                 BEGIN SELECT RAISE(ABORT, 'history locked'); END;",
            )
            .unwrap();

        let colorin = dev.find_module("colorin", 0).unwrap().id;
        let stats = dev.full_pipe.stats();
        let synced = dev.full_pipe.history_hash();
        assert!(dev.add_history_item(colorin, true).is_err());

        assert_eq!(dev.full_pipe.stats(), stats);
        assert_eq!(dev.full_pipe.history_hash(), synced);
        assert_eq!(dev.full_pipe.process(), ProcessOutcome::Dirty);
    }

    #[test]
    fn test_cancelled_pass_is_dirty() {
        let ctx = fixture::context();
        let imgid = fixture::add_raw(&ctx);
        let mut dev = Develop::load(ctx, imgid).unwrap();

        assert!(matches!(dev.full_pipe.process(), ProcessOutcome::Done { .. }));
        let handle = dev.full_pipe.shutdown_handle();
        dev.pipes_shutdown();
        assert!(handle.load(Ordering::Acquire));
        assert_eq!(dev.full_pipe.process(), ProcessOutcome::Dirty);

        dev.pipeline_update_history_all();
        assert!(matches!(dev.full_pipe.process(), ProcessOutcome::Done { .. }));
    }
}
