//! The opaque post-login service handle and its transport.
//!
//! A `WebService` wraps whatever bridge the login produced (the helper's
//! stdin/stdout, or an SSH transport) and publishes its lifecycle on a
//! watch channel. The broker's reaper consumes the state stream; the
//! embedding gateway drives attach/detach.

use std::sync::{Arc, Mutex as StdMutex};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::watch;

use crate::ssh::SshHandle;

/// Bridge between the session and whatever verified it.
pub enum Transport {
    /// stdin/stdout of the login helper, adopted after success. The child
    /// handle is kept for reaping.
    Pipe(PipeTransport),
    /// An established SSH transport.
    Ssh(SshHandle),
}

pub struct PipeTransport {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Active,
    Destroyed,
}

pub struct WebService {
    transport: StdMutex<Option<Transport>>,
    state: watch::Sender<ServiceState>,
}

impl std::fmt::Debug for WebService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebService")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl WebService {
    /// New services start idle: nothing has attached yet.
    pub fn new(transport: Transport) -> Arc<Self> {
        let (state, _) = watch::channel(ServiceState::Idle);
        Arc::new(Self {
            transport: StdMutex::new(Some(transport)),
            state,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == ServiceState::Idle
    }

    /// Called when a client attaches.
    pub fn set_active(&self) {
        self.transition(ServiceState::Active);
    }

    /// Called when the last client detaches.
    pub fn set_idle(&self) {
        self.transition(ServiceState::Idle);
    }

    fn transition(&self, next: ServiceState) {
        self.state.send_if_modified(|state| {
            if *state == ServiceState::Destroyed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Signal destruction and release the transport. Idempotent.
    pub fn dispose(&self) {
        self.state.send_if_modified(|state| {
            if *state == ServiceState::Destroyed {
                return false;
            }
            *state = ServiceState::Destroyed;
            true
        });
        if let Some(transport) = self.transport.lock().unwrap().take() {
            match transport {
                Transport::Pipe(bridge) => terminate_child(bridge.child),
                Transport::Ssh(mut handle) => handle.close(),
            }
        }
    }
}

impl Drop for WebService {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// SIGTERM a helper child and reap it off-path. Without a runtime the
/// orphan is left to init.
pub(crate) fn terminate_child(mut child: Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = child.wait().await;
        });
    }
}
