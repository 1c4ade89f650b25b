//! Transfer session state machine.
//!
//! A [`TransferSession`] is created once the platform has granted a session
//! (negotiation succeeded) and starts out `Active`. Files move
//! `Ready -> Prepared -> Transferred`, or to `Error`. The session ends in
//! exactly one of `Completed` or `Aborted`: [`TransferSession::complete`] and
//! [`TransferSession::abort`] consume it, and dropping a session that is
//! still active aborts it.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::manifest::Checksum;
use crate::platform::Trust;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Active,
    Completed,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Negotiating => write!(f, "Negotiating"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Status of one file within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    /// Known to the session, no endpoint yet.
    #[serde(alias = "UNPREPARED", alias = "WAITING_FOR_TRANSFER")]
    Ready,
    /// Endpoint allocation requested; poll until prepared.
    PrepareRequested,
    /// Endpoint allocated.
    Prepared,
    Transferred,
    Error,
}

/// One file moving through a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// Package member or library file name.
    pub name: String,
    pub size: u64,
    /// Platform key used to find this file's server checksum.
    pub key: String,
    pub endpoint: Option<Url>,
    pub trust: Trust,
    pub status: FileStatus,
    pub checksum: Option<Checksum>,
    /// The platform creates this file rather than streaming it into a disk.
    pub create: bool,
}

impl FileTransfer {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            key: String::new(),
            endpoint: None,
            trust: Trust::System,
            status: FileStatus::Ready,
            checksum: None,
            create: false,
        }
    }
}

/// Terminal operations of a platform session.
pub trait SessionControl {
    fn complete(&mut self) -> Result<()>;

    fn abort(&mut self, reason: Option<&str>) -> Result<()>;
}

/// An active transfer session and its files.
pub struct TransferSession<C: SessionControl> {
    id: String,
    state: SessionState,
    files: Vec<FileTransfer>,
    control: C,
}

impl<C: SessionControl> fmt::Debug for TransferSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl<C: SessionControl> TransferSession<C> {
    /// Wrap a session the platform has just granted.
    pub fn new(id: impl Into<String>, control: C) -> Self {
        let id = id.into();
        debug!(session = %id, "transfer session active");
        Self {
            id,
            state: SessionState::Active,
            files: Vec::new(),
            control,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn files(&self) -> &[FileTransfer] {
        &self.files
    }

    /// Add a file, returning its index.
    pub fn add_file(&mut self, file: FileTransfer) -> usize {
        self.files.push(file);
        self.files.len() - 1
    }

    pub fn file(&self, index: usize) -> Result<&FileTransfer> {
        self.files
            .get(index)
            .ok_or_else(|| Error::session(format!("no file #{index} in session {}", self.id)))
    }

    fn file_mut(&mut self, index: usize) -> Result<&mut FileTransfer> {
        self.ensure_active()?;
        let id = &self.id;
        self.files
            .get_mut(index)
            .ok_or_else(|| Error::session(format!("no file #{index} in session {id}")))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(Error::session(format!(
                "session {} is {}, not Active",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Record that preparation of a file was requested.
    pub fn mark_prepare_requested(&mut self, index: usize) -> Result<()> {
        let file = self.file_mut(index)?;
        file.status = FileStatus::PrepareRequested;
        Ok(())
    }

    /// Attach the endpoint allocated for a file.
    pub fn mark_prepared(&mut self, index: usize, endpoint: Url, trust: Trust) -> Result<()> {
        let file = self.file_mut(index)?;
        match file.status {
            FileStatus::Ready | FileStatus::PrepareRequested | FileStatus::Prepared => {
                file.endpoint = Some(endpoint);
                file.trust = trust;
                file.status = FileStatus::Prepared;
                Ok(())
            }
            other => Err(Error::session(format!(
                "cannot prepare {} in state {other:?}",
                file.name
            ))),
        }
    }

    /// The endpoint and trust to transfer a prepared file with.
    pub fn endpoint(&self, index: usize) -> Result<(Url, Trust)> {
        self.ensure_active()?;
        let file = self.file(index)?;
        match (&file.endpoint, file.status) {
            (Some(url), FileStatus::Prepared) => Ok((url.clone(), file.trust.clone())),
            _ => Err(Error::session(format!(
                "{} has no allocated endpoint ({:?})",
                file.name, file.status
            ))),
        }
    }

    pub fn mark_transferred(&mut self, index: usize) -> Result<()> {
        self.file_mut(index)?.status = FileStatus::Transferred;
        Ok(())
    }

    pub fn mark_failed(&mut self, index: usize) -> Result<()> {
        self.file_mut(index)?.status = FileStatus::Error;
        Ok(())
    }

    /// Commit the session.
    ///
    /// Every file must have been transferred; otherwise the session is
    /// aborted instead and an error returned.
    pub fn complete(mut self) -> Result<Vec<FileTransfer>> {
        self.ensure_active()?;

        if let Some(pending) = self
            .files
            .iter()
            .find(|f| f.status != FileStatus::Transferred)
        {
            let message = format!(
                "cannot complete session {}: {} is {:?}",
                self.id, pending.name, pending.status
            );
            let reason = pending.name.clone();
            self.terminate_abort(Some(&reason));
            return Err(Error::session(message));
        }

        let result = self.control.complete();
        // A failed completion is still the one terminal call.
        self.state = if result.is_ok() {
            SessionState::Completed
        } else {
            SessionState::Aborted
        };
        match result {
            Ok(()) => {
                debug!(session = %self.id, files = self.files.len(), "transfer session completed");
                Ok(std::mem::take(&mut self.files))
            }
            Err(e) => {
                error!(session = %self.id, error = %e, "completing transfer session failed");
                Err(e)
            }
        }
    }

    /// Abort the session, naming the file that caused it if any.
    pub fn abort(mut self, reason: Option<&str>) -> Result<()> {
        self.ensure_active()?;
        let result = self.control.abort(reason);
        self.state = SessionState::Aborted;
        result
    }

    fn terminate_abort(&mut self, reason: Option<&str>) {
        if let Err(e) = self.control.abort(reason) {
            warn!(session = %self.id, error = %e, "abort failed");
        }
        self.state = SessionState::Aborted;
    }
}

impl<C: SessionControl> Drop for TransferSession<C> {
    fn drop(&mut self) {
        if self.state == SessionState::Active {
            warn!(session = %self.id, "transfer session dropped while active, aborting");
            self.terminate_abort(None);
        }
    }
}
