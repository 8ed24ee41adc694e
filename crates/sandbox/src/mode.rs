//! Execution mode resolution.
//!
//! Turns the step's input records into the list of views the guest will
//! be invoked with: one view over everything, or one view per record.

use std::sync::Arc;

use crate::record::InputRecord;
use crate::script::ExecutionMode;

/// The records one invocation can see.
#[derive(Debug, Clone, PartialEq)]
pub enum InputView {
    /// Every input record, in order.
    All(Arc<[InputRecord]>),
    /// A single record and its position in the step input.
    Single {
        /// Position of the record in the step input.
        index: usize,
        /// The record.
        record: InputRecord,
    },
}

impl InputView {
    /// Mode this view belongs to.
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::All(_) => ExecutionMode::AllItems,
            Self::Single { .. } => ExecutionMode::PerItem,
        }
    }

    /// Input index for per-record views.
    pub fn item_index(&self) -> Option<usize> {
        match self {
            Self::All(_) => None,
            Self::Single { index, .. } => Some(*index),
        }
    }

    /// Visible records paired with their input index.
    pub fn records(&self) -> Vec<(usize, &InputRecord)> {
        match self {
            Self::All(records) => records.iter().enumerate().collect(),
            Self::Single { index, record } => vec![(*index, record)],
        }
    }

    /// Record at input index `index`, if visible.
    pub fn record(&self, index: usize) -> Option<&InputRecord> {
        match self {
            Self::All(records) => records.get(index),
            Self::Single {
                index: own,
                record,
            } => (*own == index).then_some(record),
        }
    }

    /// Number of visible records.
    pub fn len(&self) -> usize {
        match self {
            Self::All(records) => records.len(),
            Self::Single { .. } => 1,
        }
    }

    /// Returns `true` if no record is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `records` into invocation views for `mode`.
///
/// "Run once for all items" always yields exactly one view, even for empty
/// input. "Run once for each item" yields one view per record, in input
/// order, and nothing for empty input.
pub fn resolve(mode: ExecutionMode, records: Vec<InputRecord>) -> Vec<InputView> {
    match mode {
        ExecutionMode::AllItems => vec![InputView::All(Arc::from(records))],
        ExecutionMode::PerItem => records
            .into_iter()
            .enumerate()
            .map(|(index, record)| InputView::Single { index, record })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn records(n: usize) -> Vec<InputRecord> {
        (0..n).map(|i| InputRecord::new(json!({ "i": i }))).collect()
    }

    #[test]
    fn all_items_yields_a_single_view() {
        let views = resolve(ExecutionMode::AllItems, records(3));
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].len(), 3);
        assert_eq!(views[0].item_index(), None);
        assert_eq!(views[0].mode(), ExecutionMode::AllItems);
    }

    #[test]
    fn all_items_with_empty_input_still_runs_once() {
        let views = resolve(ExecutionMode::AllItems, Vec::new());
        assert_eq!(views.len(), 1);
        assert!(views[0].is_empty());
    }

    #[test]
    fn per_item_yields_one_view_per_record_in_order() {
        let views = resolve(ExecutionMode::PerItem, records(3));
        let indices: Vec<_> = views.iter().map(InputView::item_index).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(views[1].record(1).unwrap().data, json!({ "i": 1 }));
        assert!(views[1].record(0).is_none());
    }

    #[test]
    fn per_item_with_empty_input_yields_nothing() {
        assert!(resolve(ExecutionMode::PerItem, Vec::new()).is_empty());
    }
}
