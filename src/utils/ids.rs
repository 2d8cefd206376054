//! Identifier generation for execution records and correlations.

use uuid::Uuid;

/// Fresh globally-unique id, hyphenless for compact log lines.
#[must_use]
pub fn generate() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Correlation id tying an outbound task request to its eventual response.
#[must_use]
pub fn correlation() -> String {
    generate()
}
