use livecast_common::config::ConfigError;

/// Failure taxonomy shared by every stage of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A single capture timed out; retried in place by the frame source.
    #[error("capture timed out: {0}")]
    TransientCapture(String),
    /// The page could not be (re)loaded within the retry budget.
    #[error("renderer failed: {0}")]
    RenderFatal(String),
    #[error("encoder pipe closed: {message}; encoder said: {stderr}")]
    PipeCommunication { message: String, stderr: String },
    #[error("encoder exited unexpectedly (code {code:?}): {stderr}")]
    ProcessTerminated { code: Option<i32>, stderr: String },
    /// Narration text or speech could not be produced for a cycle.
    #[error("narration generation failed: {0}")]
    Generation(String),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether the driver must tear the session down.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StreamError::TransientCapture(_) | StreamError::Generation(_)
        )
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
