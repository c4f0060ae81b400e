#![forbid(unsafe_code)]

pub mod comment_thread;
pub mod config;
pub mod gateway;
