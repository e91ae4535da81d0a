use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::domain::problem::{ProblemNumber, ProblemRecord};

/// In-memory problem cache shared by the scan workers and the chat handler.
#[derive(Default)]
pub struct ProblemCache {
    problems: RwLock<BTreeMap<ProblemNumber, ProblemRecord>>,
}

impl ProblemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for its problem number. Returns `true`
    /// when the number was not cached before.
    pub fn upsert(&self, record: ProblemRecord) -> bool {
        let mut map = self
            .problems
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        map.insert(record.problem_number, record).is_none()
    }

    pub fn get(&self, number: ProblemNumber) -> Option<ProblemRecord> {
        self.problems
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&number)
            .cloned()
    }

    /// All records, ascending by problem number.
    pub fn list(&self) -> Vec<ProblemRecord> {
        self.problems
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.problems
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
