use thiserror::Error;

/// Structural problems with the atom graph. Raised before any atom runs and
/// never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cyclic dependency detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Atom '{atom}' depends on '{dependency}' which is not registered")]
    MissingDependency { atom: String, dependency: String },

    #[error("Unknown atom: {0}")]
    UnknownAtom(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph definition error: {0}")]
    Graph(#[from] GraphError),

    #[error("Atom '{atom}' failed after {attempts} attempt(s): {message}")]
    AtomExecution {
        atom: String,
        attempts: u32,
        message: String,
    },

    #[error("Atom '{atom}' has no argument '{argument}'")]
    MissingArgument { atom: String, argument: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown directive: {0}")]
    UnknownDirective(String),

    #[error("Lift error: {0}")]
    Lift(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] confy::ConfyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Returns the graph error if this is, or wraps, a graph definition error.
    ///
    /// Atom bodies report errors through `anyhow`, so a cycle discovered while
    /// pulling a dependency arrives here wrapped in `Other`.
    pub fn as_graph_error(&self) -> Option<&GraphError> {
        match self {
            FlowError::Graph(e) => Some(e),
            FlowError::Other(e) => e.downcast_ref::<GraphError>(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
