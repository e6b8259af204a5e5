//! Community detection and summarisation.

pub mod leiden;
pub mod report;

pub use leiden::{LeidenCommunityDetector, LeidenConfig};
pub use report::{CommunityReporter, ReportFailure};
