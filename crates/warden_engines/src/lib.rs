#![forbid(unsafe_code)]

pub mod approval;
pub mod threshold;
pub mod verifier;
