use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed rule, port or address text. The whole call is rejected
    /// before anything reaches the kernel.
    #[error("invalid firewall configuration: {0}")]
    Config(String),

    /// Load, pin, attach or map operation failed in the kernel.
    #[error("{context}: {source}")]
    Kernel {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("failed to establish audit sink: {0}")]
    Sink(String),

    #[error("firewall resources have already been released")]
    Released,

    #[error("event pipeline is already running")]
    PipelineRunning,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kernel<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Kernel {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
