use thiserror::Error;

/// Errors surfaced by the store and the consistent transaction layer.
///
/// Protocol sequencing faults are not represented here: a broken reply chain
/// means a local logic error and panics instead of returning.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no merge handler registered for type tag `{0}`")]
    UnknownTag(String),

    #[error("type tag `{tag}` is bound to a different type")]
    TagConflict { tag: String },

    #[error("codec failure: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, Error>;
