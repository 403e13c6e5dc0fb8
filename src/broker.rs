//! The authentication broker.
//!
//! One `Broker` owns the secret key, the session and pending tables, the
//! admission throttle and the idle-timer regime. All mutation happens on
//! the event loop; the locks below are held only for table operations,
//! never across an await.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::conversation::{Conversation, FinalizeKind};
use crate::drivers::{self, Action};
use crate::error::{Error, Result};
use crate::headers::{self, Headers};
use crate::nonce::NonceMinter;
use crate::service::{ServiceState, Transport, WebService};
use crate::session::{Credentials, Session, SessionTable};
use crate::ssh::SshConnector;
use crate::throttle::MaxStartups;

/// Result of a login request that did not fail outright.
#[derive(Debug)]
pub enum LoginOutcome {
    /// A session was minted; `Set-Cookie` is on the response headers.
    Authenticated(Arc<WebService>),
    /// The helper asked a question; `WWW-Authenticate` carries it and the
    /// conversation waits in the pending table.
    Challenge,
}

#[derive(Default)]
pub struct BrokerOptions {
    /// Omit the `Secure` cookie attribute (plain-HTTP deployments).
    pub cookie_insecure: bool,
    /// Transport factory for `remote-login-ssh` schemes.
    pub ssh_connector: Option<Arc<dyn SshConnector>>,
}

pub struct Broker {
    inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    pub(crate) config: Config,
    pub(crate) nonce: NonceMinter,
    pub(crate) ssh_connector: Option<Arc<dyn SshConnector>>,
    sessions: SessionTable,
    pending: StdMutex<HashMap<String, Arc<Conversation>>>,
    in_flight: AtomicU32,
    max_startups: MaxStartups,
    gssapi_not_avail: AtomicBool,
    cookie_insecure: bool,
    service_idle: Duration,
    self_weak: Weak<BrokerInner>,
    idle_reset: watch::Sender<()>,
    idling: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    /// Construct a broker and start its idle timer. Must run inside a
    /// tokio runtime. Fails if the configuration is invalid or the OS RNG
    /// cannot seed the secret key; both are fatal at startup.
    pub fn new(config: Config, options: BrokerOptions) -> Result<Self> {
        config.validate()?;
        let nonce = NonceMinter::new()?;
        let max_startups = config.max_startups();
        let service_idle = config.service_idle();
        let process_idle = config.process_idle();
        let (idle_reset, _) = watch::channel(());
        let (idling, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|self_weak| BrokerInner {
            config,
            nonce,
            ssh_connector: options.ssh_connector,
            sessions: SessionTable::default(),
            pending: StdMutex::new(HashMap::new()),
            in_flight: AtomicU32::new(0),
            max_startups,
            gssapi_not_avail: AtomicBool::new(false),
            cookie_insecure: options.cookie_insecure,
            service_idle,
            self_weak: self_weak.clone(),
            idle_reset,
            idling,
            shutdown,
        });
        tokio::spawn(process_idle_loop(Arc::downgrade(&inner), process_idle));
        Ok(Self { inner })
    }

    /// Handle an `Authorization`-bearing request. On success the response
    /// headers carry `Set-Cookie`; on an interactive challenge they carry
    /// `WWW-Authenticate`.
    pub async fn login(
        &self,
        path: &str,
        headers: &mut Headers,
        remote_peer: Option<&str>,
    ) -> Result<LoginOutcome> {
        let inner = &self.inner;
        let application = headers::parse_application(path);
        if !headers::valid_cookie_name(&application) {
            return Err(Error::InvalidData(format!(
                "invalid application name: {}",
                application
            )));
        }
        let scheme = headers::parse_scheme(headers)
            .ok_or_else(|| Error::AuthenticationFailed("authentication required".into()))?;

        if scheme == "x-login-reply" {
            // a resume re-enters the in-flight count, but a prompt already
            // consumed an admission slot, so no fresh admission decision
            let _guard = InFlightGuard::enter(inner);
            return resume(inner, &application, headers).await;
        }

        let guard = InFlightGuard::enter(inner);
        if inner.max_startups.decide(guard.active_before()) {
            tracing::warn!(%scheme, in_flight = guard.active_before() + 1, "refusing login attempt");
            return Err(Error::Throttled);
        }

        let outcome = match drivers::resolve_action(&inner.config, &scheme) {
            Action::SpawnDecoded => {
                drivers::spawn_login(inner, &application, &scheme, true, headers, remote_peer).await
            }
            Action::SpawnHeader => {
                drivers::spawn_login(inner, &application, &scheme, false, headers, remote_peer)
                    .await
            }
            Action::RemoteSsh => {
                drivers::ssh_login(inner, &application, &scheme, headers, remote_peer).await
            }
            Action::Disabled => Err(Error::AuthenticationFailed(
                "authentication disabled".into(),
            )),
        };
        if let Err(e) = &outcome {
            tracing::info!(%scheme, error = %e, "login failed");
        }
        drop(guard);
        outcome
    }

    /// Resolve a request cookie to its live session service.
    pub fn check_cookie(&self, path: &str, headers: &Headers) -> Option<Arc<WebService>> {
        let application = headers::parse_application(path);
        let raw = headers::cookie_value(headers, &application)?;
        let decoded = Zeroizing::new(BASE64.decode(raw.as_bytes()).ok()?);
        let cookie = std::str::from_utf8(&decoded).ok()?;
        if !cookie.starts_with("v=2;k=") {
            return None;
        }
        self.inner.sessions.service_for(cookie)
    }

    /// Flips to `true` once both tables have stayed empty for a full
    /// process-idle window; the surrounding process exits on it.
    pub fn subscribe_idling(&self) -> watch::Receiver<bool> {
        self.inner.idling.subscribe()
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    pub fn gssapi_unavailable(&self) -> bool {
        self.inner.gssapi_unavailable()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.inner.shutdown.send(true);
        for session in self.inner.sessions.drain() {
            drop(session);
        }
        let pending: Vec<_> = {
            let mut map = self.inner.pending.lock().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        for conversation in pending {
            conversation.destroy();
        }
    }
}

/// Resume path: feed the client's answer back into a parked conversation
/// and re-enter its driver's finalize.
async fn resume(
    inner: &Arc<BrokerInner>,
    application: &str,
    headers: &mut Headers,
) -> Result<LoginOutcome> {
    let payload = headers::take_payload(headers, false)
        .ok_or_else(|| Error::AuthenticationFailed("invalid resume token".into()))?;
    let text = std::str::from_utf8(&payload)
        .map_err(|_| Error::InvalidData("invalid resume token".into()))?;
    let mut parts = text.split_whitespace();
    let (Some(id), Some(answer), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::InvalidData("invalid resume token".into()));
    };

    let conversation = inner
        .take_pending(id)
        .ok_or_else(|| Error::AuthenticationFailed("invalid resume token".into()))?;

    let decoded = match BASE64.decode(answer.as_bytes()).ok().map(Zeroizing::new) {
        Some(decoded) if !decoded.is_empty() => decoded,
        _ => return Err(Error::AuthenticationFailed("invalid resume token".into())),
    };
    conversation.pipe().answer(&decoded).await?;

    match conversation.kind() {
        FinalizeKind::Spawn(_) => {
            let response = conversation.next_response().await;
            drivers::finalize_spawn(inner, conversation, response, application, headers)
        }
        FinalizeKind::Ssh(_) => {
            let event = drivers::wait_ssh_event(&conversation).await;
            drivers::finalize_ssh(inner, conversation, event, application, headers)
        }
    }
}

impl BrokerInner {
    pub(crate) fn gssapi_unavailable(&self) -> bool {
        self.gssapi_not_avail.load(Ordering::Relaxed)
    }

    /// Sticky until restart: once a helper reports GSSAPI unavailable,
    /// later Negotiate attempts fail without spawning anything.
    pub(crate) fn set_gssapi_unavailable(&self) {
        if !self.gssapi_not_avail.swap(true, Ordering::Relaxed) {
            tracing::warn!("GSSAPI reported unavailable, disabling Negotiate");
        }
    }

    /// Park a conversation awaiting the client's answer; purge it if the
    /// helper goes away first.
    pub(crate) fn register_pending(&self, conversation: Arc<Conversation>) {
        let id = conversation.id().to_string();
        let mut closed = conversation.pipe().closed_receiver();
        self.pending
            .lock()
            .unwrap()
            .insert(id.clone(), conversation);
        self.touch_idle_timer();

        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            if let Some(inner) = weak.upgrade() {
                if inner.take_pending(&id).is_some() {
                    tracing::debug!(id = %id, "purged pending login after helper close");
                }
            }
        });
    }

    pub(crate) fn take_pending(&self, id: &str) -> Option<Arc<Conversation>> {
        let conversation = self.pending.lock().unwrap().remove(id);
        if conversation.is_some() {
            self.touch_idle_timer();
        }
        conversation
    }

    /// Mint a cookie, store the session, and set `Set-Cookie`.
    pub(crate) fn create_session(
        &self,
        creds: Credentials,
        transport: Transport,
        application: &str,
        headers: &mut Headers,
    ) -> Arc<WebService> {
        let cookie = format!("v=2;k={}", self.nonce.mint());
        let service = WebService::new(transport);
        tracing::info!(user = %creds.user(), application, "session created");
        self.sessions.insert(Session {
            cookie: cookie.clone(),
            creds,
            service: service.clone(),
            watcher: None,
        });
        // subscribe the reaper only once the session is in the table
        let watcher = tokio::spawn(watch_session(
            self.self_weak.clone(),
            cookie.clone(),
            service.clone(),
            self.service_idle,
        ));
        self.sessions.set_watcher(&cookie, watcher);
        headers::build_set_cookie(headers, application, &cookie, !self.cookie_insecure);
        // a fresh session counts as idle until something attaches
        self.touch_idle_timer();
        service
    }

    fn remove_session(&self, cookie: &str) {
        if let Some(session) = self.sessions.remove(cookie) {
            tracing::info!(user = %session.creds.user(), "session closed");
            drop(session);
            self.touch_idle_timer();
        }
    }

    fn touch_idle_timer(&self) {
        let _ = self.idle_reset.send(());
    }
}

/// Per-session reaper: holds the service's state subscription, resets the
/// process-wide timer on idle transitions, and removes the session when
/// its idle window expires or the service is destroyed.
async fn watch_session(
    weak: Weak<BrokerInner>,
    cookie: String,
    service: Arc<WebService>,
    idle_after: Duration,
) {
    let mut state_rx = service.subscribe();
    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            ServiceState::Destroyed => break,
            ServiceState::Active => {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
            ServiceState::Idle => {
                if let Some(inner) = weak.upgrade() {
                    inner.touch_idle_timer();
                }
                match timeout(idle_after, state_rx.changed()).await {
                    Err(_) if service.is_idle() => break,
                    Err(_) => {}
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                }
            }
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.remove_session(&cookie);
    }
}

/// Process-wide idle timer: after a full quiet window with both tables
/// empty, raise the `idling` signal.
async fn process_idle_loop(weak: Weak<BrokerInner>, period: Duration) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        let mut reset = inner.idle_reset.subscribe();
        let mut shutdown = inner.shutdown.subscribe();
        tokio::select! {
            _ = reset.changed() => {}
            _ = shutdown.changed() => return,
            _ = sleep(period) => {
                if inner.sessions.is_empty() && inner.pending.lock().unwrap().is_empty() {
                    tracing::info!("broker is idle");
                    let _ = inner.idling.send(true);
                }
            }
        }
        drop(inner);
    }
}

/// Keeps `in_flight` equal to begins minus verdicts, whatever the exit
/// path.
struct InFlightGuard<'a> {
    inner: &'a BrokerInner,
    before: u32,
}

impl<'a> InFlightGuard<'a> {
    fn enter(inner: &'a BrokerInner) -> Self {
        let before = inner.in_flight.fetch_add(1, Ordering::Relaxed);
        Self { inner, before }
    }

    fn active_before(&self) -> u32 {
        self.before
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
