//! Bounded-queue writers (C4): the match-log batcher and the bulk-enroll
//! Redis-to-store drain. Both follow the same shape as the original's
//! `MatchLogWriter` — a background task, a bounded queue, and a
//! drain-then-flush shutdown.

pub mod enroll_drain;
pub mod match_log;

pub use enroll_drain::EnrollmentDrainWriter;
pub use match_log::MatchLogWriter;
