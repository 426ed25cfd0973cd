use rocket::{http::Status, response::Responder};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while building containers, driving the
/// external signing protocols, or aggregating the final archive.
///
/// `Transport` is the only class a caller may blindly retry; `RemoteFault`
/// means the remote service explicitly rejected the operation and retrying
/// with the same input will fail again.
#[derive(Debug, Error)]
pub enum Error {
    #[error("signing service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("signing service fault {code}: {message}")]
    RemoteFault { code: String, message: String },
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),
    #[error("invalid common name: {0}")]
    InvalidCommonName(String),
    #[error("invalid container entry: {0}")]
    InvalidEntry(String),
    #[error("container already finalized")]
    AlreadyFinalized,
    #[error("vote option {0:?} sanitizes to an empty file name")]
    EmptyOptionName(String),
    #[error("vote options {0:?} and {1:?} sanitize to the same file name")]
    DuplicateOptionFile(String, String),
    #[error("signing session used before it was started")]
    SessionNotStarted,
    #[error("final archive generation failed: {0}")]
    CacheGeneration(String),
    #[error(transparent)]
    Db(#[from] mongodb::error::Error),
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] zip::result::ZipError),
    #[error("{1}")]
    Status(Status, String),
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'o> {
        match &self {
            Self::RemoteFault { .. }
            | Self::MalformedCertificate(_)
            | Self::InvalidCommonName(_) => warn!("{self}"),
            Self::Status(status, _) if status.class().is_client_error() => warn!("{self}"),
            _ => error!("{self}"),
        }
        Err(match self {
            Self::Transport(_) => Status::BadGateway,
            Self::RemoteFault { .. } => Status::UnprocessableEntity,
            Self::MalformedCertificate(_)
            | Self::InvalidCommonName(_)
            | Self::EmptyOptionName(_)
            | Self::DuplicateOptionFile(..) => Status::BadRequest,
            Self::Jwt(_) => Status::Unauthorized,
            // Builder misuse and lost sessions are bugs; fail loudly.
            Self::InvalidEntry(_) | Self::AlreadyFinalized | Self::SessionNotStarted => {
                Status::InternalServerError
            }
            Self::CacheGeneration(_) | Self::Db(_) | Self::Io(_) | Self::Archive(_) => {
                Status::InternalServerError
            }
            Self::Status(status, _) => status,
        })
    }
}
