//! Errors surfaced by the build engine.

/// Any error that can occur while describing or running a build.
///
/// The enum is `Clone` because a builder stores its outcome and re-delivers
/// it to every task that requested the same builder; IO errors are carried as
/// strings for that reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A node was constructed whose absolute name already exists with a
    /// different type.
    #[error("node redefinition: {0}")]
    NodeRedefinition(String),

    /// A builder was registered for a target that already has one.
    #[error("builder redefinition for {0}")]
    BuilderRedefinition(String),

    /// A file node has no builder and its file does not exist.
    #[error("no builder to make {0}")]
    NoBuilder(String),

    /// A builder's execute reported failure.
    #[error("{0} failed")]
    BuilderFailed(String),

    /// Execute reported success but a declared non-virtual target is absent.
    #[error("{target} wasn't created by {builder}")]
    MissingOutput { target: String, builder: String },

    /// A static dependency cycle was detected before scheduling.
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// A DepFile record carries a type tag with no registered constructor.
    #[error("unknown node type: {0}")]
    UnknownType(String),

    /// A dynamic-dependency category has no registered handler.
    #[error("no deps handler for category {0}")]
    NoDepsHandler(String),

    /// A path was requested that names no known node.
    #[error("unknown node requested: {0}")]
    UnknownNode(String),

    /// The task was cancelled by its scope.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The run was interrupted (SIGINT).
    #[error("interrupted")]
    Interrupted,

    /// Misuse of a path or engine operation.
    #[error("{0}")]
    Invalid(String),

    /// An IO error, stringified to keep the enum cloneable.
    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
