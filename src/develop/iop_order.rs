/// Module order list
///
/// Maps every module instance `(operation, multi_priority)` to its position
/// in the processing pipe. Positions are the 1-based index in the list and
/// are renumbered after every structural change, so they stay unique.
/// Stored in `module_order` as `"op,prio,op,prio,..."`.

use serde::{Deserialize, Serialize};

/// Custom order, as edited by the user or pasted from another image
pub const IOP_ORDER_CUSTOM: i32 = 0;
/// Default order for scene-referred processing
pub const IOP_ORDER_V30: i32 = 2;

/// Returned for instances the list does not know
pub const IOP_ORDER_UNKNOWN: i32 = i32::MAX;

/// Processing order of the built-in modules
pub const PIPELINE_ORDER: [&str; 14] = [
    "rawprepare",
    "temperature",
    "highlights",
    "demosaic",
    "denoiseprofile",
    "flip",
    "spots",
    "exposure",
    "mask_manager",
    "basecurve",
    "colorin",
    "tonecurve",
    "colorout",
    "gamma",
];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IopOrderEntry {
    pub operation: String,
    pub instance: i32,
    pub iop_order: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IopOrderList {
    pub version: i32,
    pub entries: Vec<IopOrderEntry>,
}

impl Default for IopOrderList {
    fn default() -> Self {
        Self::v30()
    }
}

impl IopOrderList {
    /// Built-in order, one base instance per module
    pub fn v30() -> Self {
        let mut list = Self {
            version: IOP_ORDER_V30,
            entries: PIPELINE_ORDER
                .iter()
                .map(|op| IopOrderEntry { operation: op.to_string(), instance: 0, iop_order: 0 })
                .collect(),
        };
        list.renumber();
        list
    }

    /// Parse the stored text form. `None` when it is malformed.
    pub fn parse(version: i32, text: &str) -> Option<Self> {
        let fields: Vec<&str> = text.split(',').map(str::trim).filter(|f| !f.is_empty()).collect();
        if fields.len() % 2 != 0 {
            return None;
        }
        let mut entries = Vec::with_capacity(fields.len() / 2);
        for pair in fields.chunks_exact(2) {
            let instance = pair[1].parse().ok()?;
            entries.push(IopOrderEntry { operation: pair[0].to_string(), instance, iop_order: 0 });
        }
        let mut list = Self { version, entries };
        list.renumber();
        Some(list)
    }

    /// Text form for the `module_order` table
    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{},{}", e.operation, e.instance))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn renumber(&mut self) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.iop_order = i as i32 + 1;
        }
    }

    /// Position of an instance, [`IOP_ORDER_UNKNOWN`] if it is not listed
    pub fn get(&self, operation: &str, instance: i32) -> i32 {
        self.entries
            .iter()
            .find(|e| e.operation == operation && e.instance == instance)
            .map_or(IOP_ORDER_UNKNOWN, |e| e.iop_order)
    }

    pub fn contains(&self, operation: &str, instance: i32) -> bool {
        self.get(operation, instance) != IOP_ORDER_UNKNOWN
    }

    /// Add an instance right after the last instance of the same operation.
    /// Operations the list has never seen go where the built-in order puts them.
    pub fn insert_instance(&mut self, operation: &str, instance: i32) -> i32 {
        if self.contains(operation, instance) {
            return self.get(operation, instance);
        }

        let at = match self.entries.iter().rposition(|e| e.operation == operation) {
            Some(pos) => pos + 1,
            None => self.builtin_position(operation),
        };
        self.entries.insert(
            at,
            IopOrderEntry { operation: operation.to_string(), instance, iop_order: 0 },
        );
        self.renumber();
        tracing::debug!("[iop_order] inserted {}({}) at {}", operation, instance, at + 1);
        self.get(operation, instance)
    }

    fn builtin_position(&self, operation: &str) -> usize {
        let Some(rank) = PIPELINE_ORDER.iter().position(|op| *op == operation) else {
            return self.entries.len();
        };
        // before the first listed module that comes later in the built-in order
        self.entries
            .iter()
            .position(|e| {
                PIPELINE_ORDER
                    .iter()
                    .position(|op| *op == e.operation)
                    .is_some_and(|r| r > rank)
            })
            .unwrap_or(self.entries.len())
    }

    pub fn remove_instance(&mut self, operation: &str, instance: i32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !(e.operation == operation && e.instance == instance));
        let removed = self.entries.len() != before;
        if removed {
            self.renumber();
        }
        removed
    }

    /// Drop repeated `(operation, instance)` pairs, keeping the first one.
    ///
    /// # Returns
    /// * `true` if duplicates were found
    pub fn check_duplicates(&mut self) -> bool {
        let mut seen = std::collections::HashSet::new();
        let before = self.entries.len();
        self.entries.retain(|e| {
            let fresh = seen.insert((e.operation.clone(), e.instance));
            if !fresh {
                tracing::warn!("[iop_order] duplicate entry {}({}) removed", e.operation, e.instance);
            }
            fresh
        });
        let found = self.entries.len() != before;
        if found {
            self.renumber();
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v30_positions() {
        let list = IopOrderList::v30();
        assert_eq!(list.get("rawprepare", 0), 1);
        assert_eq!(list.get("gamma", 0), 14);
        assert!(list.get("exposure", 0) < list.get("colorin", 0));
        assert_eq!(list.get("exposure", 1), IOP_ORDER_UNKNOWN);
    }

    #[test]
    fn test_serialize_parse() {
        let list = IopOrderList::v30();
        let text = list.serialize();
        assert!(text.starts_with("rawprepare,0,temperature,0"));
        assert_eq!(IopOrderList::parse(IOP_ORDER_V30, &text).unwrap(), list);
        assert!(IopOrderList::parse(IOP_ORDER_CUSTOM, "exposure").is_none());
        assert!(IopOrderList::parse(IOP_ORDER_CUSTOM, "exposure,x").is_none());
    }

    #[test]
    fn test_new_instance_follows_its_base() {
        let mut list = IopOrderList::v30();
        let base = list.get("exposure", 0);
        let order = list.insert_instance("exposure", 1);
        assert_eq!(order, base + 1);
        assert_eq!(list.get("exposure", 2), IOP_ORDER_UNKNOWN);
        assert_eq!(list.insert_instance("exposure", 2), base + 2);
        // later modules moved down
        assert_eq!(list.get("gamma", 0), 16);
    }

    #[test]
    fn test_missing_base_uses_builtin_order() {
        let mut list = IopOrderList::parse(IOP_ORDER_CUSTOM, "rawprepare,0,gamma,0").unwrap();
        assert_eq!(list.insert_instance("exposure", 0), 2);
        assert_eq!(list.insert_instance("mystery", 0), 4);
    }

    #[test]
    fn test_duplicates_removed() {
        let mut list = IopOrderList::parse(IOP_ORDER_CUSTOM, "exposure,0,exposure,0,gamma,0").unwrap();
        assert!(list.check_duplicates());
        assert_eq!(list.serialize(), "exposure,0,gamma,0");
        assert_eq!(list.get("gamma", 0), 2);
        assert!(!list.check_duplicates());
    }

    #[test]
    fn test_remove_instance() {
        let mut list = IopOrderList::v30();
        list.insert_instance("exposure", 1);
        assert!(list.remove_instance("exposure", 1));
        assert!(!list.remove_instance("exposure", 1));
        assert_eq!(list, IopOrderList::v30());
    }
}
