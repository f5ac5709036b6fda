use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The filter process could not be created. Fatal to the render request.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The pager could not be created. Always reported to the user.
    #[error("failed to start viewer `{command}`: {source}")]
    ViewerSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid command line: {message}")]
    InvalidCommand { message: String },
}

impl Error {
    #[must_use]
    pub fn spawn(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            command: command.into(),
            source,
        }
    }

    /// Re-tag a spawn failure as a pager failure.
    #[must_use]
    pub fn into_viewer_error(self) -> Self {
        match self {
            Self::Spawn { command, source } => Self::ViewerSpawn { command, source },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
