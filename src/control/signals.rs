/// Synchronous signal bus
///
/// Handlers run on the raising thread, in connection order, except those
/// connected with [`SignalBus::connect_first`] which run before all others.
/// The handler list is cloned before dispatch so a handler may connect more
/// handlers or raise other signals.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    ImageInfoChanged,
    TagChanged,
    HistoryChange,
    ImageExportTmpfile,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Raised after a cache write-through
    ImageInfoChanged(Vec<i32>),
    TagChanged,
    /// Raised when an undo record closes or an undo is applied
    HistoryChange(i32),
    ImageExportTmpfile { imgid: i32, path: PathBuf },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::ImageInfoChanged(_) => SignalKind::ImageInfoChanged,
            Signal::TagChanged => SignalKind::TagChanged,
            Signal::HistoryChange(_) => SignalKind::HistoryChange,
            Signal::ImageExportTmpfile { .. } => SignalKind::ImageExportTmpfile,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Signal) + Send + Sync>;

#[derive(Default)]
pub struct SignalBus {
    first: RwLock<Vec<(SignalKind, Handler)>>,
    handlers: RwLock<Vec<(SignalKind, Handler)>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&self, kind: SignalKind, handler: F)
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        self.handlers.write().push((kind, Arc::new(handler)));
    }

    /// Connect a handler that runs before every handler added with `connect`.
    pub fn connect_first<F>(&self, kind: SignalKind, handler: F)
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        self.first.write().push((kind, Arc::new(handler)));
    }

    pub fn raise(&self, signal: Signal) {
        let kind = signal.kind();
        let handlers: Vec<Handler> = self
            .first
            .read()
            .iter()
            .chain(self.handlers.read().iter())
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect();

        tracing::trace!("[signals] raising {:?} to {} handlers", kind, handlers.len());
        for handler in handlers {
            handler(&signal);
        }
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("first", &self.first.read().len())
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_first_handler_runs_first() {
        let bus = SignalBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        bus.connect(SignalKind::ImageInfoChanged, move |_| o.lock().push("late"));
        let o = Arc::clone(&order);
        bus.connect_first(SignalKind::ImageInfoChanged, move |_| o.lock().push("first"));

        bus.raise(Signal::ImageInfoChanged(vec![1]));
        assert_eq!(*order.lock(), vec!["first", "late"]);
    }

    #[test]
    fn test_kind_filter() {
        let bus = SignalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.connect(SignalKind::HistoryChange, move |sig| s.lock().push(sig.clone()));

        bus.raise(Signal::TagChanged);
        bus.raise(Signal::HistoryChange(4));
        assert_eq!(*seen.lock(), vec![Signal::HistoryChange(4)]);
    }

    #[test]
    fn test_handler_may_raise() {
        let bus = Arc::new(SignalBus::new());
        let count = Arc::new(Mutex::new(0));

        let inner = Arc::downgrade(&bus);
        bus.connect(SignalKind::TagChanged, move |_| {
            if let Some(bus) = inner.upgrade() {
                bus.raise(Signal::HistoryChange(1));
            }
        });
        let c = Arc::clone(&count);
        bus.connect(SignalKind::HistoryChange, move |_| *c.lock() += 1);

        bus.raise(Signal::TagChanged);
        assert_eq!(*count.lock(), 1);
    }
}
