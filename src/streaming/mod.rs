//! Streaming support: SSE reconstruction and relay to the caller.

pub mod reconstructor;
pub mod relay;

pub use reconstructor::{
    CompletionMetadata, ReconstructedCompletion, StreamEvent, StreamPhase, StreamReconstructor,
};
pub use relay::{sse_response, stream_channel, StreamSink, STREAM_CHANNEL_CAPACITY};
