//! Enrollment orchestration (C9): single synchronous enrollment and bulk
//! dataset ingestion.

pub mod batch;
pub mod single;

pub use batch::{BatchItemResult, BatchOrchestrator, BatchSummary, FeatureExtractor, WorkItem};
pub use single::{EnrollOutcome, SingleEnroller};
