pub mod cache;
pub mod checksum;
pub mod color;
pub mod config;
pub mod error;
pub mod extract;
pub mod ffprobe;
pub mod job;
pub mod pipeline;
pub mod runner;
pub mod scan;
pub mod sidecar;
pub mod storyboard;
pub mod subtitle;
pub mod transcode;
pub mod translate;

#[cfg(test)]
mod testing;

pub use cache::JobCache;
pub use config::{IngestConfig, TranslationConfig};
pub use error::{BackendError, TranslateError};
pub use job::{Job, JobState, Stream};
pub use pipeline::Pipeline;
pub use runner::{CommandRunner, SystemRunner};
pub use transcode::Codec;
