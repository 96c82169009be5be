use std::sync::Arc;

use crate::value::Value;

/// A shared, immutable run of values flowing between operators.
///
/// Cloning a batch shares its values. The label names the output channel a
/// batch was produced for when several outputs are multiplexed.
#[derive(Debug, Clone)]
pub struct Batch {
    vals: Arc<[Value]>,
    label: Option<Arc<str>>,
}

impl Batch {
    pub fn new(vals: Vec<Value>) -> Self {
        Batch {
            vals: vals.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn values(&self) -> &[Value] {
        &self.vals
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    /// Body bytes across all values.
    pub fn size(&self) -> usize {
        self.vals.iter().map(Value::size).sum()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.vals.to_vec()
    }
}

/// Wraps `vals` in a batch, or returns None for an empty list.
pub fn batch_of(vals: Vec<Value>) -> Option<Batch> {
    if vals.is_empty() { None } else { Some(Batch::new(vals)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_values() {
        let b = Batch::new(vec![Value::from_int64(1), Value::from_str("ab")]).with_label("main");
        let c = b.clone();
        assert_eq!(2, c.len());
        assert_eq!(Some("main"), c.label());
        assert_eq!(3, b.size());
        assert_eq!(b.values(), c.into_values().as_slice());
        assert!(batch_of(Vec::new()).is_none());
    }
}
