//! HTTP header codec for the login flows.
//!
//! The surrounding gateway owns HTTP parsing; this module only consumes
//! `Authorization`/`Cookie` values and emits `WWW-Authenticate`/`Set-Cookie`
//! ones. Anything that can carry a secret is scrubbed on release.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use zeroize::{Zeroize, Zeroizing};

/// Cookie namespace used when the request path does not select one.
pub const DEFAULT_APPLICATION: &str = "cockpit";
const APPLICATION_PREFIX: &str = "cockpit+";

/// Request or response headers, as handed over by the HTTP layer.
/// Lookup is case-insensitive on the header name.
#[derive(Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any existing entry of the same name.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.push((name.to_string(), value.into()));
    }

    /// Remove a header and hand its value back to the caller.
    pub fn take(&mut self, name: &str) -> Option<String> {
        let idx = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Read the `Authorization` scheme token, lowercased. Leaves the header in
/// place for a later `take_payload`.
pub fn parse_scheme(headers: &Headers) -> Option<String> {
    let value = headers.get("Authorization")?;
    let token = value.trim_start().split(' ').next().unwrap_or("");
    if token.is_empty() {
        return None;
    }
    Some(token.to_ascii_lowercase())
}

/// Remove the `Authorization` header and return its payload. The header is
/// consumed (and its string zeroed) to limit exposure of the secret; the
/// returned buffer zeroes itself on drop.
pub fn take_payload(headers: &mut Headers, decode_base64: bool) -> Option<Zeroizing<Vec<u8>>> {
    let mut raw = headers.take("Authorization")?;
    let trimmed = raw.trim_start();
    let payload = match trimmed.find(' ') {
        Some(i) => trimmed[i + 1..].trim_start(),
        None => "",
    };
    let result = if payload.is_empty() {
        None
    } else if decode_base64 {
        BASE64.decode(payload.as_bytes()).ok().map(Zeroizing::new)
    } else {
        Some(Zeroizing::new(payload.as_bytes().to_vec()))
    };
    raw.zeroize();
    result
}

/// Decoded `user:password` pair from a Basic payload.
pub struct BasicCredentials {
    pub user: String,
    pub password: Zeroizing<String>,
}

/// Split a decoded Basic payload on the first colon. The password may
/// itself contain colons.
pub fn parse_basic(payload: &[u8]) -> Option<BasicCredentials> {
    let split = payload.iter().position(|&b| b == b':')?;
    let user = std::str::from_utf8(&payload[..split]).ok()?;
    let password = std::str::from_utf8(&payload[split + 1..]).ok()?;
    Some(BasicCredentials {
        user: user.to_string(),
        password: Zeroizing::new(password.to_string()),
    })
}

/// Derive the cookie namespace from the request path, so that multiple
/// embeddings coexist in one browser.
pub fn parse_application(path: &str) -> String {
    let first = path
        .strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .next()
        .unwrap_or("");
    match first.strip_prefix(APPLICATION_PREFIX) {
        Some(suffix) if !suffix.is_empty() => first.to_string(),
        _ => DEFAULT_APPLICATION.to_string(),
    }
}

/// Applications become cookie names, so they must be legal cookie names.
pub fn valid_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'_' | b'-'))
}

/// Find a cookie by name in the `Cookie` header.
pub fn cookie_value(headers: &Headers, name: &str) -> Option<String> {
    let raw = headers.get("Cookie")?;
    for part in raw.split(';') {
        let Some((n, v)) = part.trim().split_once('=') else {
            continue;
        };
        if n == name {
            return Some(v.to_string());
        }
    }
    None
}

/// Echo the helper's GSSAPI output back to the client as a `Negotiate`
/// challenge. Absent or unparseable output emits nothing; empty output
/// emits a bare `Negotiate`.
pub fn build_gssapi_challenge(headers: &mut Headers, helper_json: &serde_json::Value) {
    let Some(output) = helper_json.get("gssapi-output").and_then(|v| v.as_str()) else {
        return;
    };
    match hex::decode(output) {
        Ok(bytes) if bytes.is_empty() => headers.set("WWW-Authenticate", "Negotiate"),
        Ok(bytes) => headers.set(
            "WWW-Authenticate",
            format!("Negotiate {}", BASE64.encode(&bytes)),
        ),
        Err(_) => tracing::debug!("ignoring unparseable gssapi-output from helper"),
    }
}

/// Surface an interactive prompt as an `X-Login-Reply` challenge keyed by
/// the conversation id.
pub fn build_prompt_challenge(headers: &mut Headers, conversation_id: &str, prompt: &str) {
    headers.set(
        "WWW-Authenticate",
        format!(
            "X-Login-Reply {} {}",
            conversation_id,
            BASE64.encode(prompt.as_bytes())
        ),
    );
}

/// Set the session cookie on the response.
pub fn build_set_cookie(headers: &mut Headers, application: &str, cookie: &str, secure: bool) {
    headers.set(
        "Set-Cookie",
        format!(
            "{}={}; Path=/; {}HttpOnly",
            application,
            BASE64.encode(cookie.as_bytes()),
            if secure { "Secure; " } else { "" }
        ),
    );
}
