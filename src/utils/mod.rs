//! Small shared helpers: id generation and retry backoff.

pub mod backoff;
pub mod ids;
