pub mod local;
pub mod memory;
pub mod pipeline;
pub mod storage;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use pipeline::{UploadConfig, UploadEvent, UploadHandle, UploadPhase, UploadPipeline, UploadState};
pub use storage::{DestinationKey, SignedUrl, StoragePort, StorageReference, WriteMode};
