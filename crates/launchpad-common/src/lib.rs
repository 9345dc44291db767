//! Shared domain types for the Launchpad provisioning pipeline.
//!
//! These types cross the boundary between the template renderer, the
//! provisioning orchestrator and the live progress channel, so they live in
//! their own crate with no runtime dependencies.

pub mod job;
pub mod progress;
pub mod project;
pub mod template;

pub use job::JobPhase;
pub use progress::{ProgressEvent, ProgressFrame};
pub use project::{ProjectConfig, TemplateVariable};
pub use template::{FileContent, TemplateFile};
