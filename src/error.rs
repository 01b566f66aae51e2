/*
Typed error kinds for the conditions the CLI maps to dedicated exit codes.
Everything else travels as plain anyhow context and exits with code 1.
*/

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("no repository found (looked for a `.rededup` directory)")]
    RepositoryNotFound,

    #[error("repository index is mid-truncation; run `rededup rebuild` to recover")]
    Truncating,

    #[error("index corruption at key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("cannot read {}: {}", path.display(), source)]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Exit code for the CLI: 2 usage, 3 no repository, 4 truncating,
    /// 1 for every other failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 2,
            Error::RepositoryNotFound => 3,
            Error::Truncating => 4,
            _ => 1,
        }
    }

    pub fn corrupt(key: &[u8], reason: impl Into<String>) -> Self {
        Error::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: reason.into(),
        }
    }
}

/// Map any error chain to its CLI exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(e) => e.exit_code(),
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Usage("bad flag".into()).exit_code(), 2);
        assert_eq!(Error::RepositoryNotFound.exit_code(), 3);
        assert_eq!(Error::Truncating.exit_code(), 4);
        assert_eq!(Error::corrupt(b"m:a\0", "bad signature").exit_code(), 1);
    }

    #[test]
    fn test_exit_code_through_anyhow() {
        let err = anyhow::Error::from(Error::Truncating).context("opening repository");
        assert_eq!(exit_code_for(&err), 4);

        let plain = anyhow::anyhow!("disk on fire");
        assert_eq!(exit_code_for(&plain), 1);
    }
}
