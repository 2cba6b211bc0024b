/// Result alias that carries the custom [`CueSyncError`] type.
pub type Result<T> = std::result::Result<T, CueSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum CueSyncError {
    /// The input timeline contained an event that could not be scheduled.
    /// Raised before any cue of the offending set is registered.
    #[error("malformed event at index {index}: {reason}")]
    MalformedEvent { index: usize, reason: String },
    /// A cue referenced a handler name that is not bound at fire time.
    #[error("no handler bound for `{name}` (cue {sequence_index})")]
    MissingHandler { name: String, sequence_index: u32 },
    /// The capture run was stopped. `frame` is the virtual frame being
    /// produced when the failure happened.
    #[error("capture aborted at frame {frame}: {source}")]
    CaptureAbort {
        frame: u64,
        #[source]
        source: Box<CueSyncError>,
    },
    /// PNG or archive generation failed.
    #[error("encoding failed: {0}")]
    Encoding(String),
    /// The audio track could not be decoded.
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Free-form message, mostly surfaced by collaborators such as renderers.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
}

impl CueSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn malformed(index: usize, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            index,
            reason: reason.into(),
        }
    }

    /// Wraps `self` as the cause of an aborted capture. Errors that already
    /// describe an abort are returned unchanged.
    pub fn into_abort(self, frame: u64) -> Self {
        match self {
            abort @ Self::CaptureAbort { .. } => abort,
            other => Self::CaptureAbort {
                frame,
                source: Box::new(other),
            },
        }
    }

    /// Returns true for the cause categories the capture pipeline treats as
    /// encoding failures.
    pub fn is_encoding(&self) -> bool {
        match self {
            Self::Encoding(_) => true,
            Self::CaptureAbort { source, .. } => source.is_encoding(),
            _ => false,
        }
    }
}

impl From<&str> for CueSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for CueSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<zip::result::ZipError> for CueSyncError {
    fn from(value: zip::result::ZipError) -> Self {
        Self::Encoding(value.to_string())
    }
}

impl From<image::ImageError> for CueSyncError {
    fn from(value: image::ImageError) -> Self {
        Self::Encoding(value.to_string())
    }
}
