pub mod coordinator;
pub mod registry;
pub mod types;

pub use coordinator::{CoordinatorPhase, KeyFactory, Stage, SubmissionCoordinator};
pub use registry::{MemoryRegistry, SubmissionRegistry};
pub use types::{Campaign, Eligibility, NewSubmission, SubmissionRecord, SubmissionStatus};
