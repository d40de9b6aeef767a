//! Freelancer compliance documents for event staffing.
//!
//! Companies configure which documents they demand, reviewers approve or reject
//! uploads, a periodic sweeper warns about and expires stale approvals, and the
//! reuse evaluator lets one approval satisfy later applications.

pub mod config;
pub mod documents;
pub mod error;
pub mod telemetry;
