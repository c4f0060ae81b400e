#![forbid(unsafe_code)]

pub mod bioverify;
pub mod comment;
pub mod common;
pub mod report;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
