//! Projection engines: monotonic state-machine updates driven by normalized
//! events. Each engine splits a pure planning step (decide what changes,
//! given the current row and the event) from the SQL apply step, so the
//! transition rules are testable without a database.

pub mod consent;
pub mod recipient;
pub mod template;

pub use consent::{apply_consent_event, ConsentOutcome};
pub use recipient::{apply_message_event, ApplyOutcome};
pub use template::{apply_template_event, TemplateOutcome};
