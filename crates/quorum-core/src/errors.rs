/// Typed errors for provider adapter operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    /// An explicit `error` event on the wire. The provider message is
    /// surfaced verbatim.
    #[error("provider error ({kind}): {message}")]
    Api { kind: String, message: String },

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed payload: {0}")]
    Serialization(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Creation-time failures. These must surface before a call is in flight.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("unsupported model configuration: {0}")]
    UnsupportedModel(String),
}

impl ProviderError {
    /// True for failures detectable at model-creation time.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingCredentials(_) | Self::UnsupportedModel(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Api { .. } => "api",
            Self::Http { .. } => "http",
            Self::Network(_) => "network",
            Self::Serialization(_) => "serialization",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::MissingCredentials(_) => "missing_credentials",
            Self::UnsupportedModel(_) => "unsupported_model",
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        Self::Http { status, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_classification() {
        assert!(ProviderError::MissingCredentials("no api key".into()).is_configuration());
        assert!(ProviderError::UnsupportedModel("bad".into()).is_configuration());
        assert!(!ProviderError::Network("tcp reset".into()).is_configuration());
    }

    #[test]
    fn api_error_message_verbatim() {
        let err = ProviderError::Api {
            kind: "overloaded_error".into(),
            message: "server busy, try later".into(),
        };
        assert!(err.to_string().contains("server busy, try later"));
        assert_eq!(err.error_kind(), "api");
    }

    #[test]
    fn from_status_carries_body() {
        let err = ProviderError::from_status(429, "rate limited".into());
        match err {
            ProviderError::Http { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limited");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
