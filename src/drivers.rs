//! Login strategies: spawn a helper, drive an SSH transport, or refuse.
//!
//! The set of drivers is closed, so strategy selection is a plain match on
//! the scheme and its configured action rather than virtual dispatch. Each
//! driver has a begin half (build the conversation, start the helper) and
//! a finalize half (turn the helper's verdict into credentials, a prompt,
//! or an error); resumed conversations re-enter the finalize half through
//! the tag stored on the conversation.

use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use zeroize::Zeroizing;

use crate::authpipe::AuthPipe;
use crate::broker::{BrokerInner, LoginOutcome};
use crate::config::Config;
use crate::conversation::{Conversation, FinalizeKind, SpawnState, SshState};
use crate::error::{Error, Result};
use crate::headers::{self, Headers};
use crate::service::{PipeTransport, Transport};
use crate::session::Credentials;
use crate::ssh::{SshOutcome, SshRequest};

/// Strategy for a scheme, after configuration is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Spawn the helper with the raw header payload.
    SpawnHeader,
    /// Spawn the helper with the base64-decoded payload.
    SpawnDecoded,
    RemoteSsh,
    Disabled,
}

pub fn resolve_action(config: &Config, scheme: &str) -> Action {
    match config.scheme(scheme).and_then(|s| s.action.as_deref()) {
        Some("spawn-login-with-header") => Action::SpawnHeader,
        Some("spawn-login-with-decoded") => Action::SpawnDecoded,
        Some("remote-login-ssh") => Action::RemoteSsh,
        Some("none") => Action::Disabled,
        Some(other) => {
            // unknown actions disable the scheme, same as an explicit "none"
            tracing::warn!(scheme, action = other, "unknown login action, refusing");
            Action::Disabled
        }
        None => match scheme {
            "basic" => Action::SpawnDecoded,
            "negotiate" => Action::SpawnHeader,
            _ => Action::Disabled,
        },
    }
}

/// Spawn driver: fork the configured login helper with the auth pipe on
/// fd 3, feed it the payload, and wait for its first verdict.
pub(crate) async fn spawn_login(
    inner: &Arc<BrokerInner>,
    application: &str,
    scheme: &str,
    decode: bool,
    headers: &mut Headers,
    remote_peer: Option<&str>,
) -> Result<LoginOutcome> {
    if scheme == "negotiate" && inner.gssapi_unavailable() {
        return Err(Error::AuthenticationFailed(
            "GSSAPI authentication not available".into(),
        ));
    }

    let payload = match headers::take_payload(headers, decode) {
        Some(payload) => payload,
        // let the helper start a GSSAPI handshake with no client token
        None if scheme == "negotiate" => Zeroizing::new(Vec::new()),
        None => {
            return Err(Error::AuthenticationFailed(
                "no authentication payload".into(),
            ));
        }
    };

    // The helper never echoes the password back; keep it for the
    // credentials minted at finalize.
    let password = if scheme == "basic" {
        headers::parse_basic(&payload).map(|basic| basic.password)
    } else {
        None
    };

    let (conversation_timeout, idle_timeout) = inner.config.auth_timeouts(scheme);
    let id = inner.nonce.mint();
    let (pipe, helper_end) = AuthPipe::new(id, conversation_timeout, idle_timeout)?;
    let argv = inner.config.login_command(scheme);
    let child = spawn_helper(&argv, scheme, remote_peer, helper_end)?;
    tracing::debug!(scheme, command = %argv[0], "spawned login helper");

    let conversation = Arc::new(Conversation::new(
        FinalizeKind::Spawn(SpawnState::new(
            scheme,
            remote_peer.map(str::to_string),
            password,
        )),
        pipe,
        Some(child),
    ));

    conversation.pipe().answer(&payload).await?;
    let response = conversation.next_response().await;
    finalize_spawn(inner, conversation, response, application, headers)
}

pub(crate) fn finalize_spawn(
    inner: &Arc<BrokerInner>,
    conversation: Arc<Conversation>,
    response: Result<Option<serde_json::Value>>,
    application: &str,
    headers: &mut Headers,
) -> Result<LoginOutcome> {
    let FinalizeKind::Spawn(state) = conversation.kind() else {
        return Err(Error::Internal("conversation is not a spawned login".into()));
    };

    // Any response may carry gssapi-output; echo it regardless of the
    // verdict. A prompt challenge below overrides it.
    if let Some(json) = conversation.last_response() {
        headers::build_gssapi_challenge(headers, &json);
    }

    let json = match response {
        Ok(Some(json)) => json,
        Ok(None) => {
            return Err(Error::AuthenticationFailed(
                "login helper closed the connection".into(),
            ));
        }
        Err(e) => return Err(e),
    };

    if let Some(prompt) = json.get("prompt").and_then(|v| v.as_str()) {
        headers::build_prompt_challenge(headers, conversation.id(), prompt);
        inner.register_pending(conversation.clone());
        return Ok(LoginOutcome::Challenge);
    }

    if let Some(code) = json.get("error").and_then(|v| v.as_str()) {
        let message = json.get("message").and_then(|v| v.as_str()).unwrap_or("");
        return Err(match code {
            "authentication-failed" | "authentication-unavailable" => {
                if code == "authentication-unavailable" && state.scheme == "negotiate" {
                    inner.set_gssapi_unavailable();
                }
                Error::AuthenticationFailed(or_default(message, "authentication failed"))
            }
            "permission-denied" => Error::PermissionDenied(or_default(message, "permission denied")),
            other => Error::Internal(format!("couldn't login: {}: {}", other, message)),
        });
    }

    match json.get("user").and_then(|v| v.as_str()) {
        Some(user) if !user.is_empty() => {
            let gssapi_creds = json
                .get("gssapi-creds")
                .and_then(|v| v.as_str())
                .and_then(|s| hex::decode(s).ok())
                .map(Zeroizing::new);
            let creds = Credentials::new(
                user,
                application,
                state.take_password(),
                gssapi_creds,
                state.remote_peer.clone(),
                inner.nonce.mint(),
                Some(json.clone()),
            );

            // The helper becomes the session bridge instead of being killed.
            let mut child = conversation
                .take_child()
                .ok_or_else(|| Error::Internal("login helper already detached".into()))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::Internal("login helper stdin missing".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::Internal("login helper stdout missing".into()))?;
            let transport = Transport::Pipe(PipeTransport {
                child,
                stdin,
                stdout,
            });

            let service = inner.create_session(creds, transport, application, headers);
            Ok(LoginOutcome::Authenticated(service))
        }
        _ => Err(Error::InvalidData(
            "required fields missing in helper response".into(),
        )),
    }
}

/// Remote-SSH driver: mint credentials from the Basic payload and let a
/// transport drive the actual login, with prompts relayed over the pipe.
pub(crate) async fn ssh_login(
    inner: &Arc<BrokerInner>,
    application: &str,
    scheme: &str,
    headers: &mut Headers,
    remote_peer: Option<&str>,
) -> Result<LoginOutcome> {
    if scheme != "basic" {
        return Err(Error::AuthenticationFailed(
            "basic credentials required for remote login".into(),
        ));
    }
    let payload = headers::take_payload(headers, true).ok_or_else(|| {
        Error::AuthenticationFailed("no authentication payload".into())
    })?;
    let basic = headers::parse_basic(&payload)
        .ok_or_else(|| Error::InvalidData("malformed basic credentials".into()))?;
    if basic.user.is_empty() {
        return Err(Error::AuthenticationFailed("user name required".into()));
    }
    let connector = inner
        .ssh_connector
        .clone()
        .ok_or_else(|| Error::Internal("no SSH transport available".into()))?;

    let creds = Credentials::new(
        basic.user.clone(),
        application,
        Some(basic.password.clone()),
        None,
        remote_peer.map(str::to_string),
        inner.nonce.mint(),
        None,
    );

    let (conversation_timeout, idle_timeout) = inner.config.auth_timeouts(scheme);
    let id = inner.nonce.mint();
    let (pipe, helper_end) = AuthPipe::new(id, conversation_timeout, idle_timeout)?;
    let handle = connector.connect(SshRequest {
        host: inner.config.ssh_host(scheme),
        command: inner.config.scheme(scheme).and_then(|s| s.command.clone()),
        user: basic.user,
        password: basic.password,
        pipe: helper_end,
    });

    let conversation = Arc::new(Conversation::new(
        FinalizeKind::Ssh(SshState::new(creds, handle)),
        pipe,
        None,
    ));

    let event = wait_ssh_event(&conversation).await;
    finalize_ssh(inner, conversation, event, application, headers)
}

pub(crate) enum SshEvent {
    /// The transport settled. `None` means it vanished without reporting.
    Outcome(Option<SshOutcome>),
    /// A frame arrived on the auth pipe before the transport settled.
    Message(Result<Option<serde_json::Value>>),
}

/// First of: transport outcome, or a frame on the auth pipe.
pub(crate) async fn wait_ssh_event(conversation: &Conversation) -> SshEvent {
    let FinalizeKind::Ssh(state) = conversation.kind() else {
        return SshEvent::Message(conversation.next_response().await);
    };
    let receiver = state
        .handle
        .lock()
        .unwrap()
        .as_mut()
        .and_then(|h| h.take_outcome());
    match receiver {
        None => SshEvent::Message(conversation.next_response().await),
        Some(mut receiver) => {
            tokio::select! {
                outcome = &mut receiver => SshEvent::Outcome(outcome.ok()),
                message = conversation.next_response() => {
                    if let Some(handle) = state.handle.lock().unwrap().as_mut() {
                        handle.put_outcome(receiver);
                    }
                    SshEvent::Message(message)
                }
            }
        }
    }
}

pub(crate) fn finalize_ssh(
    inner: &Arc<BrokerInner>,
    conversation: Arc<Conversation>,
    event: SshEvent,
    application: &str,
    headers: &mut Headers,
) -> Result<LoginOutcome> {
    let FinalizeKind::Ssh(state) = conversation.kind() else {
        return Err(Error::Internal("conversation is not a remote login".into()));
    };

    match event {
        SshEvent::Outcome(Some(outcome)) => match outcome.result.as_deref() {
            None => {
                let creds = state
                    .take_creds()
                    .ok_or_else(|| Error::Internal("credentials already consumed".into()))?;
                let handle = state
                    .take_handle()
                    .ok_or_else(|| Error::Internal("transport already consumed".into()))?;
                let service =
                    inner.create_session(creds, Transport::Ssh(handle), application, headers);
                Ok(LoginOutcome::Authenticated(service))
            }
            Some("authentication-failed") => {
                if outcome.methods.get("password").map(String::as_str) == Some("no-server-support")
                {
                    Err(Error::AuthenticationFailed(
                        "authentication not supported by host".into(),
                    ))
                } else {
                    Err(Error::AuthenticationFailed("authentication failed".into()))
                }
            }
            Some("terminated") => Err(Error::AuthenticationFailed("terminated".into())),
            Some(other) => Err(Error::Internal(format!(
                "couldn't connect or authenticate: {}",
                other
            ))),
        },
        SshEvent::Outcome(None) => Err(Error::AuthenticationFailed("terminated".into())),
        SshEvent::Message(Ok(Some(json))) => {
            if let Some(prompt) = json.get("prompt").and_then(|v| v.as_str()) {
                headers::build_prompt_challenge(headers, conversation.id(), prompt);
                inner.register_pending(conversation.clone());
                Ok(LoginOutcome::Challenge)
            } else {
                state.close_handle();
                Err(Error::Internal(
                    "unexpected message from SSH transport".into(),
                ))
            }
        }
        SshEvent::Message(Ok(None)) => Err(Error::AuthenticationFailed("terminated".into())),
        SshEvent::Message(Err(e)) => {
            state.close_handle();
            Err(match e {
                Error::InvalidData(m) => Error::Internal(m),
                other => other,
            })
        }
    }
}

fn or_default(message: &str, default: &str) -> String {
    if message.is_empty() {
        default.to_string()
    } else {
        message.to_string()
    }
}

/// Fork the helper with argv `(command..., scheme, remote_peer_or_empty)`
/// and the auth pipe dup'd onto fd 3. stdin/stdout stay piped so they can
/// become the post-login bridge.
fn spawn_helper(
    argv: &[String],
    scheme: &str,
    remote_peer: Option<&str>,
    helper_end: StdUnixStream,
) -> Result<Child> {
    let (program, extra) = argv
        .split_first()
        .ok_or_else(|| Error::Internal("empty login command".into()))?;
    let fd = helper_end.into_raw_fd();
    let mut command = Command::new(program);
    command
        .args(extra)
        .arg(scheme)
        .arg(remote_peer.unwrap_or(""))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    unsafe {
        command.pre_exec(move || {
            // land the auth pipe on fd 3; everything else is close-on-exec
            if fd == 3 {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(fd, 3) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let spawned = command.spawn();
    // the parent's copy of the helper end is no longer needed
    unsafe {
        libc::close(fd);
    }
    spawned.map_err(|e| Error::Internal(format!("couldn't start login helper: {}", e)))
}
