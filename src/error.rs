use thiserror::Error;

/// Error type returned by listeners and caller-supplied handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Phase label attached to errors raised by an interceptor's result handler
pub const RESULT_HANDLER_PHASE: &str = "result-handler invocation";

#[derive(Debug, Error)]
pub enum Error {
    /// Value can't be used as an event: it is not an object or has no string `type` field
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Shorthand argument list passed to [BindingConfig::from_args](crate::BindingConfig::from_args)
    /// has an unsupported shape
    #[error("invalid watch arguments: {0}")]
    InvalidArguments(String),

    /// Result handler of an armed interceptor failed. Listeners are already removed when
    /// this error is observed.
    #[error("{phase} failed in scope `{}`", .scope.as_deref().unwrap_or("<anonymous>"))]
    Handler {
        scope: Option<String>,
        phase: &'static str,
        #[source]
        source: BoxError,
    },
}
