use serde::{Deserialize, Serialize};

/// Header preceding every body on the wire.
///
/// Field names are serialized in `PascalCase` to stay wire compatible with
/// peers that encode headers as `{"ServiceMethod", "Seq", "Error"}`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Target method, formatted as `Service.Method`.
    pub service_method: String,

    /// Sequence number chosen by the client.
    pub seq: u64,

    /// Error text set by the server; empty on success.
    #[serde(default)]
    pub error: String,
}

impl Header {
    /// Creates a request header.
    #[must_use]
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Whether the header reports a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
