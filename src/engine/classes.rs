use std::collections::HashMap;

use crate::{EngineErr, Result};

/// Bidirectional mapping between class names and dense zero-based indices.
///
/// Built once at engine construction and immutable afterwards; every label
/// that ever reaches the engine must resolve through this table.
#[derive(Debug)]
pub struct ClassTable {
    names: Box<[String]>,
    indices: HashMap<String, usize>,
}

impl ClassTable {
    /// Builds the table from the configured class names.
    ///
    /// # Errors
    /// Returns `EngineErr::DuplicateClass` if a name appears twice.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Box<[String]> = names.into_iter().map(Into::into).collect();
        let mut indices = HashMap::with_capacity(names.len());

        for (index, name) in names.iter().enumerate() {
            if indices.insert(name.clone(), index).is_some() {
                return Err(EngineErr::DuplicateClass {
                    label: name.clone(),
                });
            }
        }

        Ok(Self { names, indices })
    }

    /// The number of classes.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Resolves a class name to its dense index.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    /// The name of the class at `index`.
    ///
    /// # Panics
    /// If `index` is out of range; indices handed out by this table are
    /// always in range.
    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// All class names in index order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One classification result: a class name and the model's confidence in it.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    pub confidence: f32,
}

/// Builds the prediction list for one inference pass, sorted by confidence
/// descending; ties keep ascending class-index order (the sort is stable).
pub(crate) fn ranked_predictions(classes: &ClassTable, confidences: &[f32]) -> Vec<Prediction> {
    let mut predictions: Vec<Prediction> = confidences
        .iter()
        .enumerate()
        .map(|(index, &confidence)| Prediction {
            class_name: classes.name(index).to_owned(),
            confidence,
        })
        .collect();

    predictions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    predictions
}
