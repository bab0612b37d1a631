#![deny(warnings)]
#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions
)]

pub mod bus;
pub mod codec;
pub mod config;
pub mod enroll;
pub mod error;
pub mod gallery;
pub mod he;
pub mod matcher;
pub mod pipeline_pool;
pub mod runtime;
pub mod store;
pub mod writers;

pub use config::Config;
pub use enroll::{BatchOrchestrator, EnrollOutcome, SingleEnroller};
pub use error::{IrisRegError, Result};
pub use gallery::{EyeSide, Gallery, GalleryEntry, GalleryPayload};
pub use matcher::{MatchOutcome, he::HeMatcher, plaintext::PlaintextMatcher};
pub use pipeline_pool::PipelinePool;
pub use runtime::System;
pub use store::Store;
