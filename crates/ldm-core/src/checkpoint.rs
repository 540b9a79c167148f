//! Checkpoint mapping
//!
//! An ordered list of `key → tensor` entries. Order is the order the binder
//! visits them in; duplicate keys are kept and the later one wins.

use candle_core::{DType, Shape, Tensor};

/// One checkpoint entry
#[derive(Debug, Clone)]
pub struct Entry {
    key: String,
    shape: Shape,
    dtype: DType,
    tensor: Option<Tensor>,
}

impl Entry {
    /// Entry carrying tensor data
    pub fn new(key: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            key: key.into(),
            shape: tensor.shape().clone(),
            dtype: tensor.dtype(),
            tensor: Some(tensor),
        }
    }

    /// Entry with shape and dtype only (read from a file header)
    pub fn header(key: impl Into<String>, shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            key: key.into(),
            shape: shape.into(),
            dtype,
            tensor: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Tensor data, absent for header-only entries
    pub fn tensor(&self) -> Option<&Tensor> {
        self.tensor.as_ref()
    }

    /// Size of the stored data in bytes
    pub fn size_bytes(&self) -> usize {
        self.shape.elem_count() * self.dtype.size_in_bytes()
    }
}

/// Ordered mapping from parameter path to tensor
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    entries: Vec<Entry>,
}

impl Checkpoint {
    /// Create an empty checkpoint
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry with data
    pub fn push(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.entries.push(Entry::new(key, tensor));
    }

    /// Append a prepared entry
    pub fn push_entry(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in stored order
    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Last entry stored under `key`
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().rev().find(|e| e.key == key)
    }

    /// Keys in stored order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// True if no entry carries tensor data
    pub fn is_header_only(&self) -> bool {
        self.entries.iter().all(|e| e.tensor.is_none())
    }

    /// Total size of all entries in bytes
    pub fn size_bytes(&self) -> usize {
        self.entries.iter().map(Entry::size_bytes).sum()
    }

    /// Entries whose key starts with `prefix`, in stored order
    pub fn filter_prefix(&self, prefix: &str) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| e.key.starts_with(prefix))
                .cloned()
                .collect(),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Tensor)> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = (K, Tensor)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, tensor)| Entry::new(key, tensor))
                .collect(),
        }
    }
}

impl FromIterator<Entry> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Checkpoint {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
