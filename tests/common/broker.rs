#![allow(dead_code)]
// Shared scaffolding for broker integration tests: scripted /bin/sh login
// helpers inherited on fd 3, plus header builders.

use authgate::broker::{Broker, BrokerOptions};
use authgate::config::{Config, SchemeConfig};
use authgate::headers::Headers;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::time::Duration;
use tempfile::TempDir;

/// Write a helper script to a temp dir and return the command string for
/// the scheme configuration. Keep the `TempDir` alive for the test.
pub fn helper_script(body: &str) -> (TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("helper.sh");
    std::fs::write(&path, body).unwrap();
    let command = format!("sh {}", path.display());
    (dir, command)
}

pub fn config_with_helper(scheme: &str, command: &str) -> Config {
    let mut cfg = Config::default();
    cfg.schemes.insert(
        scheme.to_string(),
        SchemeConfig {
            command: Some(command.to_string()),
            ..Default::default()
        },
    );
    cfg
}

pub fn broker(cfg: Config) -> Broker {
    Broker::new(cfg, BrokerOptions::default()).unwrap()
}

pub fn basic_headers(user: &str, password: &str) -> Headers {
    let mut headers = Headers::new();
    let payload = BASE64.encode(format!("{}:{}", user, password));
    headers.set("Authorization", format!("Basic {}", payload));
    headers
}

pub fn negotiate_headers(token: Option<&str>) -> Headers {
    let mut headers = Headers::new();
    match token {
        Some(token) => headers.set("Authorization", format!("Negotiate {}", token)),
        None => headers.set("Authorization", "Negotiate"),
    }
    headers
}

pub fn resume_headers(id: &str, answer: &str) -> Headers {
    let mut headers = Headers::new();
    headers.set(
        "Authorization",
        format!("X-Login-Reply {} {}", id, BASE64.encode(answer)),
    );
    headers
}

pub fn cookie_headers(name: &str, cookie: &str) -> Headers {
    let mut headers = Headers::new();
    headers.set("Cookie", format!("{}={}", name, BASE64.encode(cookie)));
    headers
}

/// Decode `Set-Cookie` into `(cookie name, decoded cookie string)`.
pub fn decode_set_cookie(headers: &Headers) -> (String, String) {
    let value = headers.get("Set-Cookie").expect("Set-Cookie missing");
    let (pair, _attrs) = value.split_once(';').unwrap_or((value, ""));
    let (name, b64) = pair.split_once('=').expect("malformed Set-Cookie");
    let decoded = BASE64.decode(b64.trim()).expect("cookie not base64");
    (name.to_string(), String::from_utf8(decoded).unwrap())
}

/// Parse an `X-Login-Reply` challenge into `(conversation id, prompt)`.
pub fn parse_login_challenge(headers: &Headers) -> (String, String) {
    let value = headers
        .get("WWW-Authenticate")
        .expect("WWW-Authenticate missing");
    let mut parts = value.split_whitespace();
    assert_eq!(parts.next(), Some("X-Login-Reply"));
    let id = parts.next().expect("conversation id").to_string();
    let prompt = parts.next().expect("prompt").to_string();
    let prompt = String::from_utf8(BASE64.decode(prompt).unwrap()).unwrap();
    (id, prompt)
}

/// Poll `predicate` until it holds or `secs` seconds elapse.
pub async fn wait_until(secs: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
