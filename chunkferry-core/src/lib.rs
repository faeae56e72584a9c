pub mod address;
pub mod backend;
pub mod chunker;
pub mod config;
pub mod deadline;
pub mod download;
pub mod error;
pub mod manifest;
pub mod merkle;
pub mod orchestrator;
pub mod path_safety;
pub mod progress;
pub mod store;
pub mod upload;
pub mod verify;

pub use address::RootHash;
pub use backend::{BackendError, DirBackend, MemoryBackend, NodeSelection, Receipt, StorageBackend, Stored};
pub use chunker::{Chunk, Chunker};
pub use config::{PipelineOptions, TransferConfig};
pub use deadline::CancelToken;
pub use download::{DownloadPipeline, DownloadPlan, DownloadReport, OutputTarget};
pub use error::{Error, Result, Stage, StageError};
pub use manifest::Manifest;
pub use orchestrator::{Orchestrator, RoundTripReport};
pub use store::{ChunkStore, TransferRecord, TransferState};
pub use upload::{UploadOutcome, UploadPipeline};
pub use verify::VerifyReport;
