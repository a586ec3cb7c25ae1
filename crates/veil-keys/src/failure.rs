//! Failure policy for errors raised by protocol tasks.
//!
//! A handler records the failure and answers whether the affected secure
//! session should be torn down and rebuilt.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{MacValidationError, StoreError};
use crate::identity::now_millis;

/// Where in the client a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Unknown,
    ErroneousNode,
    MediaConnection,
    Stream,
    Login,
    AppStateSync,
    Message,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Location::Unknown => "unknown",
            Location::ErroneousNode => "erroneous_node",
            Location::MediaConnection => "media_connection",
            Location::Stream => "stream",
            Location::Login => "login",
            Location::AppStateSync => "app_state_sync",
            Location::Message => "message",
        };
        f.write_str(name)
    }
}

pub trait FailureHandler: Send + Sync {
    /// Returns true if the session should be rebuilt.
    fn handle(&self, location: Location, error: &anyhow::Error) -> bool;
}

impl<F> FailureHandler for F
where
    F: Fn(Location, &anyhow::Error) -> bool + Send + Sync,
{
    fn handle(&self, location: Location, error: &anyhow::Error) -> bool {
        self(location, error)
    }
}

/// True if `error`, or anything in its cause chain, is a frame MAC failure.
pub fn is_authentication_failure(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.is::<MacValidationError>()
            || matches!(
                cause.downcast_ref::<StoreError>(),
                Some(StoreError::Authentication(_))
            )
    })
}

/// Only an inbound message that failed authentication justifies a rebuild.
pub fn should_rebuild_session(location: Location, error: &anyhow::Error) -> bool {
    location == Location::Message && is_authentication_failure(error)
}

/// Logs every failure and saves its error chain as a diagnostic file.
#[derive(Debug)]
pub struct DefaultFailureHandler {
    diagnostics_dir: PathBuf,
    sequence: AtomicU64,
}

impl DefaultFailureHandler {
    pub fn new(diagnostics_dir: impl Into<PathBuf>) -> Self {
        Self {
            diagnostics_dir: diagnostics_dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.diagnostics_dir())
    }

    fn save_diagnostic(&self, location: Location, error: &anyhow::Error) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.diagnostics_dir)?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = self
            .diagnostics_dir
            .join(format!("{}-{sequence}.txt", now_millis()));
        fs::write(&path, format!("location: {location}\n\n{error:?}\n"))?;
        Ok(path)
    }
}

impl FailureHandler for DefaultFailureHandler {
    fn handle(&self, location: Location, error: &anyhow::Error) -> bool {
        warn!(%location, "protocol failure: {error:#}");
        match self.save_diagnostic(location, error) {
            Ok(path) => debug!(path = %path.display(), "saved failure diagnostic"),
            Err(e) => warn!("cannot save failure diagnostic: {e}"),
        }
        should_rebuild_session(location, error)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    fn mac_failure() -> anyhow::Error {
        anyhow::Error::new(StoreError::from(MacValidationError { counter: 3 }))
    }

    #[test]
    fn only_message_mac_failures_rebuild() {
        assert!(should_rebuild_session(Location::Message, &mac_failure()));
        assert!(!should_rebuild_session(Location::Stream, &mac_failure()));
        assert!(!should_rebuild_session(
            Location::Message,
            &anyhow::anyhow!("socket closed")
        ));
        assert!(!should_rebuild_session(
            Location::Message,
            &anyhow::Error::new(StoreError::NoAppKeys)
        ));
    }

    #[test]
    fn wrapped_mac_failure_is_detected() {
        let bare = anyhow::Error::new(MacValidationError { counter: 0 });
        assert!(is_authentication_failure(&bare));

        let wrapped: anyhow::Result<()> = Err(mac_failure()).context("decrypting frame");
        assert!(is_authentication_failure(&wrapped.unwrap_err()));
    }

    #[test]
    fn default_handler_writes_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let handler = DefaultFailureHandler::new(dir.path().join("errors"));

        assert!(handler.handle(Location::Message, &mac_failure()));
        assert!(!handler.handle(Location::Login, &anyhow::anyhow!("bad credentials")));

        let mut files: Vec<_> = fs::read_dir(dir.path().join("errors"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        files.sort();
        assert_eq!(files.len(), 2);
        let contents: Vec<String> = files
            .iter()
            .map(|path| fs::read_to_string(path).unwrap())
            .collect();
        assert!(contents.iter().any(|c| c.contains("location: login")));
        assert!(contents.iter().any(|c| c.contains("read counter 3")));
    }

    #[test]
    fn closures_are_handlers() {
        let handler = |location: Location, _: &anyhow::Error| location == Location::Stream;
        assert!(handler.handle(Location::Stream, &anyhow::anyhow!("eof")));
        assert!(!FailureHandler::handle(&handler, Location::Login, &anyhow::anyhow!("eof")));
    }
}
