//! Authenticated sessions: credentials, the cookie-keyed session table.
//!
//! Credentials are owned by exactly one session and poisoned (secret
//! fields overwritten) before release. The table maps the full cookie
//! string `v=2;k=<nonce>` to its session; the reaper in the broker
//! removes entries when their service idles out or is destroyed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use zeroize::{Zeroize, Zeroizing};

use crate::service::WebService;

/// Everything a login produced: identity, secrets, provenance.
pub struct Credentials {
    user: String,
    application: String,
    password: Option<Zeroizing<String>>,
    gssapi_creds: Option<Zeroizing<Vec<u8>>>,
    remote_peer: Option<String>,
    csrf_token: String,
    login_data: Option<serde_json::Value>,
}

impl Credentials {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user: impl Into<String>,
        application: impl Into<String>,
        password: Option<Zeroizing<String>>,
        gssapi_creds: Option<Zeroizing<Vec<u8>>>,
        remote_peer: Option<String>,
        csrf_token: String,
        login_data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            user: user.into(),
            application: application.into(),
            password,
            gssapi_creds,
            remote_peer,
            csrf_token,
            login_data,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().map(String::as_str)
    }

    pub fn gssapi_creds(&self) -> Option<&[u8]> {
        self.gssapi_creds.as_deref().map(Vec::as_slice)
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote_peer.as_deref()
    }

    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    /// Raw JSON the helper returned on success.
    pub fn login_data(&self) -> Option<&serde_json::Value> {
        self.login_data.as_ref()
    }

    /// Overwrite every secret field. Runs on drop as well; callers that
    /// release credentials early call it explicitly.
    pub fn poison(&mut self) {
        if let Some(password) = self.password.as_mut() {
            password.zeroize();
        }
        self.password = None;
        if let Some(gssapi) = self.gssapi_creds.as_mut() {
            gssapi.zeroize();
        }
        self.gssapi_creds = None;
        self.login_data = None;
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.poison();
    }
}

// Secrets stay out of debug output.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("application", &self.application)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}

/// One authenticated session.
pub struct Session {
    pub cookie: String,
    pub creds: Credentials,
    pub service: Arc<WebService>,
    /// Reaper task holding the service's signal subscriptions.
    pub watcher: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.service.dispose();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Cookie-keyed table of live sessions.
#[derive(Default)]
pub struct SessionTable {
    sessions: StdMutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn insert(&self, session: Session) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.cookie.clone(), session);
    }

    /// Attach the reaper task handle to an inserted session. A session
    /// that was already removed again leaves the handle to run out on its
    /// own; its removal is a no-op.
    pub fn set_watcher(&self, cookie: &str, watcher: JoinHandle<()>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(cookie) {
            session.watcher = Some(watcher);
        }
    }

    pub fn service_for(&self, cookie: &str) -> Option<Arc<WebService>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(cookie).map(|s| s.service.clone())
    }

    pub fn remove(&self, cookie: &str) -> Option<Session> {
        self.sessions.lock().unwrap().remove(cookie)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn drain(&self) -> Vec<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.drain().map(|(_, s)| s).collect()
    }
}
