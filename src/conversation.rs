//! A single in-flight login attempt.
//!
//! A conversation owns the auth pipe to its helper, remembers the most
//! recent helper response, and carries a tag naming the driver that
//! created it so a resumed attempt finalizes through the same decision
//! tree. Both the pending table and the request path may hold it, hence
//! the shared ownership.

use std::sync::Mutex as StdMutex;
use tokio::process::Child;
use zeroize::Zeroizing;

use crate::authpipe::{AuthPipe, PipeEvent};
use crate::error::{Error, Result};
use crate::service::terminate_child;
use crate::session::Credentials;
use crate::ssh::SshHandle;

/// Which driver created the conversation.
pub enum FinalizeKind {
    Spawn(SpawnState),
    Ssh(SshState),
}

pub struct SpawnState {
    pub scheme: String,
    /// Peer captured at begin; a resumed conversation keeps it.
    pub remote_peer: Option<String>,
    password: StdMutex<Option<Zeroizing<String>>>,
}

impl SpawnState {
    /// `password` is re-parsed from the original Basic payload so it never
    /// round-trips through the helper.
    pub fn new(
        scheme: impl Into<String>,
        remote_peer: Option<String>,
        password: Option<Zeroizing<String>>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            remote_peer,
            password: StdMutex::new(password),
        }
    }

    pub fn take_password(&self) -> Option<Zeroizing<String>> {
        self.password.lock().unwrap().take()
    }
}

pub struct SshState {
    creds: StdMutex<Option<Credentials>>,
    pub(crate) handle: StdMutex<Option<SshHandle>>,
}

impl SshState {
    pub fn new(creds: Credentials, handle: SshHandle) -> Self {
        Self {
            creds: StdMutex::new(Some(creds)),
            handle: StdMutex::new(Some(handle)),
        }
    }

    pub fn take_creds(&self) -> Option<Credentials> {
        self.creds.lock().unwrap().take()
    }

    pub fn take_handle(&self) -> Option<SshHandle> {
        self.handle.lock().unwrap().take()
    }

    pub fn close_handle(&self) {
        if let Some(mut handle) = self.take_handle() {
            handle.close();
        }
    }
}

pub struct Conversation {
    id: String,
    kind: FinalizeKind,
    pipe: AuthPipe,
    last_response: StdMutex<Option<serde_json::Value>>,
    child: StdMutex<Option<Child>>,
}

impl Conversation {
    pub fn new(kind: FinalizeKind, pipe: AuthPipe, child: Option<Child>) -> Self {
        Self {
            id: pipe.id().to_string(),
            kind,
            pipe,
            last_response: StdMutex::new(None),
            child: StdMutex::new(child),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &FinalizeKind {
        &self.kind
    }

    pub fn pipe(&self) -> &AuthPipe {
        &self.pipe
    }

    /// Await the next helper frame. `Ok(Some)` is a parsed response, also
    /// remembered as the last response; `Ok(None)` an orderly close before
    /// any response; `Err` a parse failure or a close with a reason.
    pub async fn next_response(&self) -> Result<Option<serde_json::Value>> {
        match self.pipe.next_event().await {
            PipeEvent::Message(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes)
            {
                Ok(json) => {
                    *self.last_response.lock().unwrap() = Some(json.clone());
                    Ok(Some(json))
                }
                Err(e) => Err(Error::InvalidData(format!(
                    "unparseable message from login helper: {}",
                    e
                ))),
            },
            PipeEvent::Closed(None) => Ok(None),
            PipeEvent::Closed(Some(reason)) => Err(Error::AuthenticationFailed(format!(
                "authentication aborted: {}",
                reason
            ))),
        }
    }

    pub fn last_response(&self) -> Option<serde_json::Value> {
        self.last_response.lock().unwrap().clone()
    }

    /// Hand the helper process over, to become the session bridge.
    pub fn take_child(&self) -> Option<Child> {
        self.child.lock().unwrap().take()
    }

    /// Tear down whatever helper is still attached: SIGTERM and reap a
    /// subprocess that was never adopted, release an SSH handle.
    pub fn destroy(&self) {
        if let Some(child) = self.take_child() {
            terminate_child(child);
        }
        if let FinalizeKind::Ssh(state) = &self.kind {
            state.close_handle();
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.destroy();
    }
}
