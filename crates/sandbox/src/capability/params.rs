//! Step parameter access for guests (`$parameter`).

use serde_json::{Map, Value};

/// Resolves step parameters, possibly differently per input record.
pub trait ParameterAccessor: Send + Sync {
    /// Names of all parameters.
    fn names(&self) -> Vec<String>;

    /// Value of `name` as resolved for input record `item_index`.
    fn get(&self, name: &str, item_index: usize) -> Option<Value>;

    /// Every parameter resolved for `item_index`.
    fn resolve(&self, item_index: usize) -> Map<String, Value> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                let value = self.get(&name, item_index)?;
                Some((name, value))
            })
            .collect()
    }
}

/// Parameters that resolve to the same values for every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticParameters {
    values: Map<String, Value>,
}

impl StaticParameters {
    /// Wraps an already-resolved parameter map.
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl ParameterAccessor for StaticParameters {
    fn names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn get(&self, name: &str, _item_index: usize) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

/// Parameters resolved ahead of time for each input record.
///
/// Records past the end see no parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemParameters {
    per_item: Vec<Map<String, Value>>,
}

impl ItemParameters {
    /// One map per input record, in input order.
    pub fn new(per_item: Vec<Map<String, Value>>) -> Self {
        Self { per_item }
    }
}

impl ParameterAccessor for ItemParameters {
    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .per_item
            .iter()
            .flat_map(|values| values.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn get(&self, name: &str, item_index: usize) -> Option<Value> {
        self.per_item.get(item_index)?.get(name).cloned()
    }
}
