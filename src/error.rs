use thiserror::Error;

// Display output is sent to clients verbatim as the response `msg`.
#[derive(Debug, Error)]
pub enum RequestError {
    // ── Protocol errors ───────────────────────────────────────────────────
    #[error("Fail; malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("No encoded input file content, nor path provided with input filename.")]
    NoInput,

    #[error("Fail; input content is not valid Base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Fail; unsupported document type: {0}")]
    UnsupportedType(String),

    // ── Resource limits ───────────────────────────────────────────────────
    #[error("Fail; File too big to process.")]
    TooBig,

    // ── Job handling ──────────────────────────────────────────────────────
    #[error("Fail; {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Conversion(#[from] GatewayError),
}

impl RequestError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Fail; conversion failed: {0}")]
    Fatal(String),

    #[error("Fail; conversion engine failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Fail; conversion engine unavailable, retry later")]
    CircuitOpen,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the connection before sending a request")]
    Closed,

    #[error("request frame exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("reading request: {0}")]
    Io(#[from] std::io::Error),
}
