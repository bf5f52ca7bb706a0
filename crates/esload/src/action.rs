//! Action mapping: pairs each record with the destination index

use serde::Serialize;
use std::sync::Arc;

use crate::source::{Record, RowDefect};

/// A pending write of one document into one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    destination: Arc<str>,
    #[serde(rename = "document")]
    record: Record,
}

impl Action {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The document payload
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    /// Source line of the originating row
    pub fn line(&self) -> u64 {
        self.record.line()
    }

    pub fn defect(&self) -> Option<RowDefect> {
        self.record.defect()
    }

    /// Estimated bytes this action adds to a bulk request body
    pub fn estimated_size(&self) -> usize {
        // {"index":{"_index":"..."}} plus two newlines
        self.destination.len() + 26 + self.record.estimated_size()
    }
}

/// Stateless `Record -> Action` mapping for a fixed destination
#[derive(Debug, Clone)]
pub struct ActionMapper {
    destination: Arc<str>,
}

impl ActionMapper {
    pub fn new(destination: impl Into<Arc<str>>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn map(&self, record: Record) -> Action {
        Action {
            destination: Arc::clone(&self.destination),
            record,
        }
    }
}
