use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Placeholder replaced by the node's own name in templated labels.
pub const NODE_NAME_TEMPLATE: &str = "%N";

/// A `key=value` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPair {
    pub key: String,
    pub value: String,
}

impl LabelPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// Substitute `%N` in key and value.
    pub fn render(&self, node: &str) -> LabelPair {
        LabelPair {
            key: self.key.replace(NODE_NAME_TEMPLATE, node),
            value: self.value.replace(NODE_NAME_TEMPLATE, node),
        }
    }

    pub fn is_set(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }
}

impl FromStr for LabelPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.contains('=') => {
                Ok(LabelPair::new(key.trim(), value.trim()))
            }
            _ => Err(Error::Config(format!("label {:?} is not of the form key=value", s))),
        }
    }
}

impl fmt::Display for LabelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The labels the health watcher reads and owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthLabels {
    /// Marks a node as served by the backend; may contain `%N`.
    pub eligibility: LabelPair,
    /// Added to eligible nodes.
    pub readiness: LabelPair,
    /// Operator acknowledgement that an unhealthy node may be fenced.
    pub maintenance: LabelPair,
    /// Set by the watcher while a node is fenced.
    pub fenced: LabelPair,
    /// Nodes whose blacklist is managed by an external HA system.
    pub ha_managed: Option<LabelPair>,
}
