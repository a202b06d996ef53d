pub mod extract;
pub mod job;
pub mod metadata;
pub mod optimization;
pub mod plan;
pub mod scan;
pub mod writer;

#[cfg(test)]
pub mod mock;

pub use job::{ScanRequest, run_scan};
pub use plan::PlanProvider;
pub use scan::{ScanObserver, ScanProgress, ScanSummary};
pub use writer::IndexScheme;
