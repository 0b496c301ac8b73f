/// Undo/redo stack shared by the darkroom and the lighttable
///
/// Each record carries a tagged payload; the subsystem that recorded it is
/// the one that knows how to apply it, so `pop` only hands the payloads back
/// and moves them to the opposite stack.

use parking_lot::Mutex;

use crate::develop::undo::HistoryUndo;
use crate::history::snapshot::LtHistoryUndo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UndoType {
    /// Darkroom history edits
    History,
    /// Lighttable history operations (delete, paste, compress...)
    LighttableHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoAction {
    Undo,
    Redo,
}

#[derive(Debug, Clone)]
pub enum UndoData {
    History(HistoryUndo),
    LighttableHistory(LtHistoryUndo),
}

impl UndoData {
    pub fn kind(&self) -> UndoType {
        match self {
            UndoData::History(_) => UndoType::History,
            UndoData::LighttableHistory(_) => UndoType::LighttableHistory,
        }
    }
}

#[derive(Debug, Clone)]
struct UndoRecord {
    group: u64,
    data: UndoData,
}

#[derive(Debug, Default)]
struct UndoState {
    undo: Vec<UndoRecord>,
    redo: Vec<UndoRecord>,
    /// Open group: (kind, id, nesting depth)
    group: Option<(UndoType, u64, u32)>,
    next_group: u64,
}

impl UndoState {
    fn fresh_group(&mut self) -> u64 {
        self.next_group += 1;
        self.next_group
    }
}

#[derive(Debug, Default)]
pub struct UndoStack {
    state: Mutex<UndoState>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a group; records until the matching `end_group` undo together.
    /// Groups nest, only the outermost one counts.
    pub fn start_group(&self, kind: UndoType) {
        let mut state = self.state.lock();
        match &mut state.group {
            Some((_, _, depth)) => *depth += 1,
            None => {
                let id = state.fresh_group();
                state.group = Some((kind, id, 1));
            }
        }
    }

    pub fn end_group(&self) {
        let mut state = self.state.lock();
        if let Some((_, _, depth)) = &mut state.group {
            *depth -= 1;
            if *depth == 0 {
                state.group = None;
            }
        }
    }

    /// Push a record. Any redo history of the same kind is dropped.
    pub fn record(&self, data: UndoData) {
        let kind = data.kind();
        let mut state = self.state.lock();
        let group = match state.group {
            Some((_, id, _)) => id,
            None => state.fresh_group(),
        };
        state.redo.retain(|r| r.data.kind() != kind);
        state.undo.push(UndoRecord { group, data });
    }

    /// Take the most recent group of `kind` off the undo (or redo) stack.
    ///
    /// The records move to the opposite stack and are returned in the order
    /// they must be applied: newest first for an undo, oldest first for a redo.
    pub fn pop(&self, kind: UndoType, action: UndoAction) -> Vec<UndoData> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let (from, to) = match action {
            UndoAction::Undo => (&mut state.undo, &mut state.redo),
            UndoAction::Redo => (&mut state.redo, &mut state.undo),
        };

        let Some(group) = from.iter().rev().find(|r| r.data.kind() == kind).map(|r| r.group) else {
            return Vec::new();
        };

        let (taken, kept): (Vec<UndoRecord>, Vec<UndoRecord>) =
            from.drain(..).partition(|r| r.group == group && r.data.kind() == kind);
        *from = kept;

        let mut data: Vec<UndoData> = taken.iter().map(|r| r.data.clone()).collect();
        if action == UndoAction::Undo {
            data.reverse();
        }
        to.extend(taken);
        data
    }

    pub fn can_undo(&self, kind: UndoType) -> bool {
        self.state.lock().undo.iter().any(|r| r.data.kind() == kind)
    }

    pub fn can_redo(&self, kind: UndoType) -> bool {
        self.state.lock().redo.iter().any(|r| r.data.kind() == kind)
    }

    /// Visit every recorded payload of `kind`, on both stacks.
    pub fn iterate_mut<F>(&self, kind: UndoType, mut f: F)
    where
        F: FnMut(&mut UndoData),
    {
        let mut state = self.state.lock();
        let state = &mut *state;
        for record in state.undo.iter_mut().chain(state.redo.iter_mut()) {
            if record.data.kind() == kind {
                f(&mut record.data);
            }
        }
    }

    pub fn clear(&self, kind: UndoType) {
        let mut state = self.state.lock();
        state.undo.retain(|r| r.data.kind() != kind);
        state.redo.retain(|r| r.data.kind() != kind);
    }

    pub fn len(&self, kind: UndoType) -> usize {
        self.state.lock().undo.iter().filter(|r| r.data.kind() == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::snapshot::LtHistoryUndo;
    use crate::state::history_db::StoredHistory;

    fn lt(imgid: i32, end: i32) -> UndoData {
        UndoData::LighttableHistory(LtHistoryUndo {
            imgid,
            before: StoredHistory { history_end: end, ..Default::default() },
            after: StoredHistory { history_end: end + 1, ..Default::default() },
        })
    }

    fn imgid_of(data: &UndoData) -> i32 {
        match data {
            UndoData::LighttableHistory(lt) => lt.imgid,
            UndoData::History(h) => h.imgid,
        }
    }

    #[test]
    fn test_pop_moves_between_stacks() {
        let stack = UndoStack::new();
        stack.record(lt(1, 0));
        assert!(stack.can_undo(UndoType::LighttableHistory));
        assert!(!stack.can_undo(UndoType::History));

        let popped = stack.pop(UndoType::LighttableHistory, UndoAction::Undo);
        assert_eq!(popped.len(), 1);
        assert!(!stack.can_undo(UndoType::LighttableHistory));
        assert!(stack.can_redo(UndoType::LighttableHistory));

        let redone = stack.pop(UndoType::LighttableHistory, UndoAction::Redo);
        assert_eq!(redone.len(), 1);
        assert!(stack.can_undo(UndoType::LighttableHistory));
    }

    #[test]
    fn test_group_pops_together_newest_first() {
        let stack = UndoStack::new();
        stack.start_group(UndoType::LighttableHistory);
        stack.record(lt(1, 0));
        stack.start_group(UndoType::LighttableHistory);
        stack.record(lt(2, 0));
        stack.end_group();
        stack.record(lt(3, 0));
        stack.end_group();
        stack.record(lt(4, 0));

        let popped = stack.pop(UndoType::LighttableHistory, UndoAction::Undo);
        assert_eq!(popped.iter().map(imgid_of).collect::<Vec<_>>(), vec![4]);

        let popped = stack.pop(UndoType::LighttableHistory, UndoAction::Undo);
        assert_eq!(popped.iter().map(imgid_of).collect::<Vec<_>>(), vec![3, 2, 1]);

        let redone = stack.pop(UndoType::LighttableHistory, UndoAction::Redo);
        assert_eq!(redone.iter().map(imgid_of).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_new_record_drops_redo() {
        let stack = UndoStack::new();
        stack.record(lt(1, 0));
        stack.pop(UndoType::LighttableHistory, UndoAction::Undo);
        stack.record(lt(2, 0));
        assert!(!stack.can_redo(UndoType::LighttableHistory));
        assert_eq!(stack.len(UndoType::LighttableHistory), 1);
    }

    #[test]
    fn test_iterate_mut() {
        let stack = UndoStack::new();
        stack.record(lt(1, 0));
        stack.record(lt(2, 0));
        stack.iterate_mut(UndoType::LighttableHistory, |data| {
            if let UndoData::LighttableHistory(lt) = data {
                lt.imgid *= 10;
            }
        });
        let popped = stack.pop(UndoType::LighttableHistory, UndoAction::Undo);
        assert_eq!(imgid_of(&popped[0]), 20);
    }
}
