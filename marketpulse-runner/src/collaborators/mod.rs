//! External collaborators run after the warehouse load: the transformation
//! command and the BI tool refresh. Both are reached through narrow traits so
//! the orchestrator can be driven with substitutes.

pub mod command;
pub mod metabase;

pub use command::CommandTransformer;
pub use metabase::{pick_database, DatabaseRef, MetabaseAuth, MetabaseRefresher};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    NonZeroExit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{step} request failed: {message}")]
    Request { step: String, message: String },

    #[error("{step} returned HTTP {status}: {body}")]
    Status {
        step: String,
        status: u16,
        body: String,
    },

    #[error("unexpected {step} response: {message}")]
    UnexpectedResponse { step: String, message: String },

    #[error("no database with engine '{engine}' is registered")]
    DatabaseNotFound { engine: String },
}

/// Runs the modeling step over the warehouse schema.
pub trait Transformer {
    fn name(&self) -> &str;
    fn run(&self) -> Result<(), CollaboratorError>;
}

/// Asks the dashboard tool to pick up the refreshed warehouse.
pub trait Refresher {
    fn name(&self) -> &str;
    fn run(&self) -> Result<(), CollaboratorError>;
}
