//! Seam for remote login over an SSH transport.
//!
//! The transport itself lives with the embedding gateway; the broker only
//! drives the contract below. A connector is handed the credentials and
//! the helper side of the auth pipe, and reports exactly one outcome.

use std::collections::HashMap;
use std::os::unix::net::UnixStream as StdUnixStream;
use tokio::sync::oneshot;
use zeroize::Zeroizing;

/// Terminal outcome of an SSH login attempt.
#[derive(Debug, Default)]
pub struct SshOutcome {
    /// `None` on success, otherwise a failure code such as
    /// `"authentication-failed"` or `"terminated"`.
    pub result: Option<String>,
    /// Per-method results, e.g. `password -> no-server-support`.
    pub methods: HashMap<String, String>,
}

/// Connection request handed to a connector.
pub struct SshRequest {
    pub host: String,
    /// Optional remote command, from the scheme configuration.
    pub command: Option<String>,
    pub user: String,
    pub password: Zeroizing<String>,
    /// Helper side of the auth pipe. Interactive prompts surface here as
    /// single-line JSON frames; answers come back the same way.
    pub pipe: StdUnixStream,
}

/// A live transport: the settled-outcome receiver plus a closer that
/// releases the underlying connection.
pub struct SshHandle {
    outcome: Option<oneshot::Receiver<SshOutcome>>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl SshHandle {
    pub fn new(
        outcome: oneshot::Receiver<SshOutcome>,
        closer: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            outcome: Some(outcome),
            closer: Some(closer),
        }
    }

    pub(crate) fn take_outcome(&mut self) -> Option<oneshot::Receiver<SshOutcome>> {
        self.outcome.take()
    }

    pub(crate) fn put_outcome(&mut self, rx: oneshot::Receiver<SshOutcome>) {
        self.outcome = Some(rx);
    }

    /// Release the transport. Idempotent.
    pub fn close(&mut self) {
        if let Some(close) = self.closer.take() {
            close();
        }
    }
}

impl Drop for SshHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory installed at broker construction.
pub trait SshConnector: Send + Sync {
    /// Start an asynchronous login against `request.host`. Must not block.
    fn connect(&self, request: SshRequest) -> SshHandle;
}
