use std::error::Error as StdError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("author {0} not found")]
    AuthorNotFound(String),
    #[error("malformed enclosure metadata for {cid}: {reason}")]
    MalformedMetadata { cid: String, reason: String },
    #[error("malformed cast hash {0:?}")]
    MalformedHash(String),
    #[error("cast {0} does not carry a lemon3 enclosure")]
    NoEnclosure(String),
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("{context}: {source}")]
    LocalState {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("event stream failed: {0}")]
    StreamFailed(String),
    #[error("signing: {0}")]
    Signing(String),
}

impl Error {
    pub fn transport<C, E>(context: C, source: E) -> Self
    where
        C: Into<String>,
        E: Into<BoxError>,
    {
        Error::Transport {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn local_state<C, E>(context: C, source: E) -> Self
    where
        C: Into<String>,
        E: Into<BoxError>,
    {
        Error::LocalState {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn malformed_metadata<C: Into<String>, R: Into<String>>(cid: C, reason: R) -> Self {
        Error::MalformedMetadata {
            cid: cid.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure came from a collaborator on the network.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}
