//! Provenance table carried along with datasets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single table cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

/// Column-oriented table, one entry per contributing observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetaTable {
    columns: BTreeMap<String, Vec<MetaValue>>,
}

impl MetaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-row table from `(column, value)` pairs.
    pub fn from_row(row: Vec<(&str, MetaValue)>) -> Self {
        let columns = row
            .into_iter()
            .map(|(name, value)| (name.to_string(), vec![value]))
            .collect();
        Self { columns }
    }

    pub fn n_rows(&self) -> usize {
        self.columns.values().map(|c| c.len()).max().unwrap_or(0)
    }

    pub fn column(&self, name: &str) -> Option<&[MetaValue]> {
        self.columns.get(name).map(|c| c.as_slice())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(|k| k.as_str()).collect()
    }

    /// Concatenate the rows of `other`, taking the union of columns.
    /// Columns missing on either side are padded with [`MetaValue::Null`].
    pub fn hstack(&self, other: &MetaTable) -> MetaTable {
        let (n_self, n_other) = (self.n_rows(), other.n_rows());
        let mut columns = BTreeMap::new();
        let names = self.columns.keys().chain(other.columns.keys());
        for name in names {
            if columns.contains_key(name) {
                continue;
            }
            let mut values = Vec::with_capacity(n_self + n_other);
            let pad = |values: &mut Vec<MetaValue>, col: Option<&Vec<MetaValue>>, n: usize| {
                let col = col.map(|c| c.as_slice()).unwrap_or(&[]);
                values.extend(col.iter().cloned());
                values.extend(std::iter::repeat(MetaValue::Null).take(n - col.len()));
            };
            pad(&mut values, self.columns.get(name), n_self);
            pad(&mut values, other.columns.get(name), n_other);
            columns.insert(name.clone(), values);
        }
        MetaTable { columns }
    }
}
