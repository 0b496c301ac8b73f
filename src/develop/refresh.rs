/// Instance list repair after the history was swapped underneath it
///
/// Undo and redo replace the history wholesale, so the live instances may no
/// longer match it: an item may name an instance that was retired, and an
/// instance may be left without any item.

use super::iop_order::PIPELINE_ORDER;
use super::module::ModuleId;
use super::Develop;

fn pipeline_rank(op: &str) -> usize {
    PIPELINE_ORDER.iter().position(|p| *p == op).unwrap_or(PIPELINE_ORDER.len())
}

impl Develop {
    /// Bring the instances in line with the history.
    ///
    /// # Returns
    /// * `true` when instances were added, removed or renumbered, meaning
    ///   the pipes need a rebuild rather than a resync
    pub fn refresh_nodes(&mut self) -> bool {
        let mut changed = self.fix_multi_priority_drift();
        changed |= self.create_deleted_modules();
        changed |= self.check_deleted_instances();
        if changed {
            self.resync_modules_order();
        }
        changed
    }

    fn fix_multi_priority_drift(&mut self) -> bool {
        let mut changed = false;
        for idx in 0..self.history.len() {
            let Some(id) = self.history[idx].module else {
                continue;
            };
            let multi_priority = self.history[idx].multi_priority;
            if let Some(module) = self.iop.iter_mut().find(|m| m.id == id) {
                if module.multi_priority != multi_priority {
                    tracing::debug!(
                        "[refresh] {} priority {} -> {}",
                        module.op(),
                        module.multi_priority,
                        multi_priority
                    );
                    module.multi_priority = multi_priority;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Items whose instance is gone get a new one, from the base instance.
    fn create_deleted_modules(&mut self) -> bool {
        let mut changed = false;
        for idx in 0..self.history.len() {
            let live = self.history[idx].module.is_some_and(|id| self.module(id).is_some());
            if live {
                continue;
            }
            let op = self.history[idx].op_name.clone();
            let multi_priority = self.history[idx].multi_priority;

            let existing = self.find_module(&op, multi_priority).map(|m| m.id);
            let id = match existing {
                Some(id) => id,
                None => {
                    if self.base_module(&op).is_none() {
                        tracing::warn!("[refresh] no module `{}' to recreate item {}", op, self.history[idx].num);
                        continue;
                    }
                    let id = self.alloc_module_id();
                    let Some(base) = self.base_module(&op) else {
                        continue;
                    };
                    let mut module = base.duplicate_as(id, multi_priority);
                    module.multi_name.clone_from(&self.history[idx].multi_name);
                    module.iop_order = self.iop_order_list.insert_instance(&op, multi_priority);
                    self.iop.push(module);
                    tracing::debug!("[refresh] recreated {}({}) as {:?}", op, multi_priority, id);
                    changed = true;
                    id
                }
            };
            for item in self.history.iter_mut().filter(|h| h.op_name == op && h.multi_priority == multi_priority) {
                item.module = Some(id);
            }
            self.history_undo_reset_module(&op, multi_priority, id);
        }
        changed
    }

    /// Retire instances no item refers to. Base instances stay unless two
    /// of them exist for the same operation.
    fn check_deleted_instances(&mut self) -> bool {
        let mut candidates: Vec<(usize, i32, ModuleId, &'static str)> = self
            .iop
            .iter()
            .map(|m| (pipeline_rank(m.op()), m.multi_priority, m.id, m.op()))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut retire: Vec<ModuleId> = Vec::new();
        for (i, &(_, multi_priority, id, op)) in candidates.iter().enumerate() {
            let in_history = self.history.iter().any(|h| h.module == Some(id));
            if multi_priority > 0 {
                if !in_history {
                    retire.push(id);
                }
                continue;
            }
            // a second base instance of the same operation
            let twin = candidates
                .iter()
                .enumerate()
                .find(|(j, c)| *j != i && c.3 == op && c.1 == 0 && !retire.contains(&c.2))
                .map(|(_, c)| c.2);
            let Some(twin) = twin else {
                continue;
            };
            let twin_in_history = self.history.iter().any(|h| h.module == Some(twin));
            match (in_history, twin_in_history) {
                (false, true) => retire.push(id),
                (true, false) => {}
                (true, true) => tracing::warn!("[refresh] two base instances of {} are in the history", op),
                (false, false) => {
                    tracing::debug!("[refresh] two unused base instances of {}, keeping the older", op);
                    if twin < id {
                        retire.push(id);
                    }
                }
            }
        }

        for id in &retire {
            let Some(idx) = self.module_index(*id) else {
                continue;
            };
            self.history_undo_invalidate_module(*id);
            if self.gui_module == Some(*id) {
                self.gui_module = None;
            }
            let module = self.iop.remove(idx);
            if self.find_module(module.op(), module.multi_priority).is_none() {
                self.iop_order_list.remove_instance(module.op(), module.multi_priority);
            }
            tracing::debug!("[refresh] retired {}({}) {:?}", module.op(), module.multi_priority, module.id);
            self.retired.push(module);
        }
        !retire.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixture;
    use crate::state::data::ImageFlags;

    fn loaded() -> Develop {
        let ctx = fixture::context();
        let imgid = fixture::add_image(&ctx, "r.jpg", ImageFlags::LDR);
        Develop::load(ctx, imgid).unwrap()
    }

    #[test]
    fn test_nothing_to_do_after_load() {
        let mut dev = loaded();
        assert!(!dev.refresh_nodes());
        assert!(dev.retired.is_empty());
    }

    #[test]
    fn test_orphan_instances_are_retired() {
        let mut dev = loaded();
        let base = dev.find_module("exposure", 0).unwrap().id;
        let first = dev.duplicate_module(base).unwrap();
        let second = dev.duplicate_module(base).unwrap();

        assert!(dev.refresh_nodes());
        let retired: Vec<ModuleId> = dev.retired.iter().map(|m| m.id).collect();
        // highest priority first within an operation
        assert_eq!(retired, vec![second, first]);
        assert!(dev.module(base).is_some());
        assert!(!dev.iop_order_list.contains("exposure", 1));
        assert!(dev.check_iop_order("test"));
    }

    #[test]
    fn test_items_get_their_instance_back() {
        let mut dev = loaded();
        let colorin = dev.find_module("colorin", 0).unwrap().id;
        let idx = dev.history.iter().position(|h| h.module == Some(colorin)).unwrap();
        dev.history[idx].module = None;

        assert!(!dev.refresh_nodes());
        assert_eq!(dev.history[idx].module, Some(colorin));
    }

    #[test]
    fn test_recreates_missing_instance() {
        let mut dev = loaded();
        let base = dev.find_module("exposure", 0).unwrap().id;
        let copy = dev.duplicate_module(base).unwrap();
        dev.add_history_item(copy, true).unwrap();

        let idx = dev.module_index(copy).unwrap();
        let module = dev.iop.remove(idx);
        dev.retired.push(module);

        assert!(dev.refresh_nodes());
        let again = dev.find_module("exposure", 1).unwrap().id;
        assert_ne!(again, copy);
        assert_eq!(dev.history.last().unwrap().module, Some(again));
    }

    #[test]
    fn test_priority_drift() {
        let mut dev = loaded();
        let base = dev.find_module("exposure", 0).unwrap().id;
        let copy = dev.duplicate_module(base).unwrap();
        dev.add_history_item(copy, true).unwrap();
        dev.module_mut(copy).unwrap().multi_priority = 5;

        assert!(dev.refresh_nodes());
        assert_eq!(dev.module(copy).unwrap().multi_priority, 1);
    }

    #[test]
    fn test_duplicate_base_keeps_the_one_in_history() {
        let mut dev = loaded();
        let base = dev.find_module("exposure", 0).unwrap().id;
        let copy = dev.duplicate_module(base).unwrap();
        dev.add_history_item(copy, true).unwrap();
        // the base was deleted and the copy took its place
        let last = dev.history.len() - 1;
        dev.history[last].multi_priority = 0;

        assert!(dev.refresh_nodes());
        assert!(dev.module(copy).is_some());
        assert!(dev.module(base).is_none());
        assert_eq!(dev.find_module("exposure", 0).unwrap().id, copy);
    }

    #[test]
    fn test_duplicate_bases_without_history_keep_the_older() {
        let mut dev = loaded();
        let base = dev.find_module("exposure", 0).unwrap().id;
        let copy = dev.duplicate_module(base).unwrap();
        dev.module_mut(copy).unwrap().multi_priority = 0;

        assert!(dev.refresh_nodes());
        assert!(dev.module(base).is_some());
        assert!(dev.module(copy).is_none());
    }
}
