//! Agent lifecycle state and its durable single-value store.
//!
//! The state file holds the decimal integer of a [`ClientState`]. Other processes
//! may rewrite it at any time; a reader that sees an empty file is looking at a
//! write in progress and polls again, up to the configured poll timeout.

use crate::resilience::{poll_async, poll_blocking, PollConfig, PollOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ClientState { WaitingGm = 0, Training = 1, Sending = 2, GmReady = 3 }

impl ClientState {
    pub const ALL: [ClientState; 4] = [ClientState::WaitingGm, ClientState::Training, ClientState::Sending, ClientState::GmReady];
    pub fn as_i64(self) -> i64 { self as i64 }
}

impl TryFrom<i64> for ClientState {
    type Error = StateError;
    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v { 0 => Ok(ClientState::WaitingGm), 1 => Ok(ClientState::Training), 2 => Ok(ClientState::Sending), 3 => Ok(ClientState::GmReady), other => Err(StateError::UnknownState(other)) }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { ClientState::WaitingGm => "waiting_gm", ClientState::Training => "training", ClientState::Sending => "sending", ClientState::GmReady => "gm_ready" })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")] Io(#[from] std::io::Error),
    #[error("state file content is not an integer: {0:?}")] Corrupt(String),
    #[error("unknown client state value {0}")] UnknownState(i64),
    #[error("state unavailable: file stayed empty for {waited:?} ({attempts} reads)")] Unavailable { attempts: usize, waited: Duration },
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    poll: PollConfig,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        Self { path: dir.as_ref().join(name), poll: PollConfig::default() }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self { self.poll = poll; self }

    pub fn path(&self) -> &Path { &self.path }

    /// Creates the parent directory and records the initial `waiting_gm` state.
    pub fn init(&self) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() { std::fs::create_dir_all(dir)?; }
        self.write_state(ClientState::WaitingGm)
    }

    pub fn write_state(&self, state: ClientState) -> Result<(), StateError> {
        std::fs::write(&self.path, state.as_i64().to_string())?;
        debug!(path = %self.path.display(), %state, "state written");
        Ok(())
    }

    pub fn read_state(&self) -> Result<ClientState, StateError> {
        let outcome = poll_blocking(&self.poll, |attempt| match std::fs::read_to_string(&self.path) {
            Ok(raw) => parse_state(&raw, attempt),
            Err(e) => Err(StateError::Io(e)),
        })?;
        self.settle(outcome)
    }

    pub async fn read_state_async(&self) -> Result<ClientState, StateError> {
        let outcome = poll_async(&self.poll, |attempt| {
            let path = self.path.clone();
            async move {
                match tokio::fs::read_to_string(&path).await {
                    Ok(raw) => parse_state(&raw, attempt),
                    Err(e) => Err(StateError::Io(e)),
                }
            }
        }).await?;
        self.settle(outcome)
    }

    fn settle(&self, outcome: PollOutcome<ClientState>) -> Result<ClientState, StateError> {
        match outcome {
            PollOutcome::Ready(s) => Ok(s),
            PollOutcome::TimedOut { attempts, waited } => {
                warn!(path = %self.path.display(), attempts, ?waited, "state file stayed empty");
                Err(StateError::Unavailable { attempts, waited })
            }
        }
    }
}

fn parse_state(raw: &str, attempt: usize) -> Result<Option<ClientState>, StateError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        if attempt == 0 { debug!("state file empty, writer in progress"); }
        return Ok(None);
    }
    let v: i64 = trimmed.parse().map_err(|_| StateError::Corrupt(trimmed.to_string()))?;
    ClientState::try_from(v).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> StateStore {
        StateStore::new(dir, "state").with_poll(PollConfig { interval: Duration::from_millis(1), timeout: Duration::from_millis(40) })
    }

    #[test]
    fn write_then_read_every_state() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(dir.path());
        st.init().unwrap();
        assert_eq!(st.read_state().unwrap(), ClientState::WaitingGm);
        for s in ClientState::ALL {
            st.write_state(s).unwrap();
            assert_eq!(st.read_state().unwrap(), s);
        }
        assert_eq!(std::fs::read_to_string(st.path()).unwrap(), "3");
    }

    #[test]
    fn empty_file_times_out_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(dir.path());
        std::fs::write(st.path(), "").unwrap();
        assert!(matches!(st.read_state(), Err(StateError::Unavailable { .. })));
    }

    #[test]
    fn empty_file_recovers_when_writer_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let st = StateStore::new(dir.path(), "state").with_poll(PollConfig { interval: Duration::from_millis(2), timeout: Duration::from_secs(2) });
        std::fs::write(st.path(), "").unwrap();
        let writer = st.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.write_state(ClientState::Sending).unwrap();
        });
        assert_eq!(st.read_state().unwrap(), ClientState::Sending);
        handle.join().unwrap();
    }

    #[test]
    fn garbage_and_unknown_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(dir.path());
        std::fs::write(st.path(), "two").unwrap();
        assert!(matches!(st.read_state(), Err(StateError::Corrupt(_))));
        std::fs::write(st.path(), "7").unwrap();
        assert!(matches!(st.read_state(), Err(StateError::UnknownState(7))));
        std::fs::write(st.path(), "1\n").unwrap();
        assert_eq!(st.read_state().unwrap(), ClientState::Training);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(store(dir.path()).read_state(), Err(StateError::Io(_))));
    }

    #[tokio::test]
    async fn async_read_matches_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(dir.path());
        st.init().unwrap();
        st.write_state(ClientState::GmReady).unwrap();
        assert_eq!(st.read_state_async().await.unwrap(), ClientState::GmReady);
    }
}
