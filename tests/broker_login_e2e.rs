// Integration tests for the spawn login driver, with scripted /bin/sh
// helpers speaking the fd-3 protocol.

use authgate::broker::LoginOutcome;
use authgate::config::SchemeConfig;
use authgate::error::Error;
use std::sync::Arc;

#[path = "common/broker.rs"]
mod common;
use common::*;

#[tokio::test]
async fn e2e_basic_login_success() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"user":"alice","login-data":{"zone":"prod"}}\n' >&3
exec cat
"#,
    );
    let broker = broker(config_with_helper("basic", &command));

    let mut headers = basic_headers("alice", "secret");
    let outcome = broker
        .login("/", &mut headers, Some("127.0.0.1"))
        .await
        .unwrap();
    let service = match outcome {
        LoginOutcome::Authenticated(service) => service,
        LoginOutcome::Challenge => panic!("unexpected challenge"),
    };

    assert!(service.is_idle());
    assert_eq!(broker.in_flight(), 0);
    assert_eq!(broker.session_count(), 1);

    let set_cookie = headers.get("Set-Cookie").unwrap().to_string();
    assert!(set_cookie.contains("Path=/"));
    assert!(set_cookie.contains("Secure"));
    assert!(set_cookie.contains("HttpOnly"));

    let (name, cookie) = decode_set_cookie(&headers);
    assert_eq!(name, "cockpit");
    assert!(cookie.starts_with("v=2;k="));

    let lookup = broker
        .check_cookie("/", &cookie_headers(&name, &cookie))
        .expect("cookie should resolve");
    assert!(Arc::ptr_eq(&service, &lookup));
}

#[tokio::test]
async fn e2e_application_namespaces_cookie() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"user":"alice"}\n' >&3
exec cat
"#,
    );
    let broker = broker(config_with_helper("basic", &command));

    let mut headers = basic_headers("alice", "secret");
    broker
        .login("/cockpit+app/socket", &mut headers, None)
        .await
        .unwrap();

    let (name, cookie) = decode_set_cookie(&headers);
    assert_eq!(name, "cockpit+app");

    assert!(
        broker
            .check_cookie("/cockpit+app/other", &cookie_headers(&name, &cookie))
            .is_some()
    );
    // the plain namespace does not see it
    assert!(
        broker
            .check_cookie("/", &cookie_headers(&name, &cookie))
            .is_none()
    );
}

#[tokio::test]
async fn e2e_invalid_application_rejected() {
    let broker = broker(Default::default());
    let mut headers = basic_headers("alice", "secret");
    let err = broker
        .login("/cockpit+bad%20app/x", &mut headers, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidData(_)), "{:?}", err);
}

#[tokio::test]
async fn e2e_authentication_failed() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"error":"authentication-failed","message":"bad password"}\n' >&3
"#,
    );
    let broker = broker(config_with_helper("basic", &command));

    let err = broker
        .login("/", &mut basic_headers("alice", "wrong"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)), "{:?}", err);
    assert_eq!(err.public_message(), "Authentication failed");
    assert_eq!(broker.session_count(), 0);
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn e2e_permission_denied() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"error":"permission-denied"}\n' >&3
"#,
    );
    let broker = broker(config_with_helper("basic", &command));

    let err = broker
        .login("/", &mut basic_headers("alice", "secret"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{:?}", err);
}

#[tokio::test]
async fn e2e_unparseable_helper_output() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf 'not json\n' >&3
"#,
    );
    let broker = broker(config_with_helper("basic", &command));

    let err = broker
        .login("/", &mut basic_headers("alice", "secret"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidData(_)), "{:?}", err);
}

#[tokio::test]
async fn e2e_missing_required_fields() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"ok":true}\n' >&3
"#,
    );
    let broker = broker(config_with_helper("basic", &command));

    let err = broker
        .login("/", &mut basic_headers("alice", "secret"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidData(_)), "{:?}", err);
}

#[tokio::test]
async fn e2e_helper_exits_without_response() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
exit 0
"#,
    );
    let broker = broker(config_with_helper("basic", &command));

    let err = broker
        .login("/", &mut basic_headers("alice", "secret"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)), "{:?}", err);
}

#[tokio::test]
async fn e2e_helper_spawn_failure() {
    let broker = broker(config_with_helper("basic", "/nonexistent/authgate-session"));

    let err = broker
        .login("/", &mut basic_headers("alice", "secret"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)), "{:?}", err);
}

#[tokio::test]
async fn e2e_unknown_scheme_is_disabled() {
    let broker = broker(Default::default());

    let mut headers = authgate::headers::Headers::new();
    headers.set("Authorization", "Bearer xyz");
    let err = broker.login("/", &mut headers, None).await.unwrap_err();
    match err {
        Error::AuthenticationFailed(m) => assert!(m.contains("disabled"), "{}", m),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn e2e_helper_response_timeout() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
sleep 3
printf '{"user":"alice"}\n' >&3
"#,
    );
    let mut cfg = config_with_helper("basic", &command);
    let section = cfg.schemes.get_mut("basic").unwrap();
    section.timeout = Some("1".to_string());
    section.response_timeout = Some("1".to_string());
    let broker = broker(cfg);

    let err = broker
        .login("/", &mut basic_headers("alice", "secret"), None)
        .await
        .unwrap_err();
    match err {
        Error::AuthenticationFailed(m) => assert!(m.contains("timeout"), "{}", m),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn e2e_gssapi_unavailable_disables_negotiate() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let script = format!(
        r#"echo run >> {}
read -r payload <&3
printf '{{"error":"authentication-unavailable","message":"no gssapi"}}\n' >&3
"#,
        marker.display()
    );
    let path = dir.path().join("helper.sh");
    std::fs::write(&path, script).unwrap();
    let broker = broker(config_with_helper(
        "negotiate",
        &format!("sh {}", path.display()),
    ));

    let err = broker
        .login("/", &mut negotiate_headers(Some("dG9rZW4=")), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)), "{:?}", err);
    assert!(broker.gssapi_unavailable());
    assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 1);

    // the next attempt fails fast, without spawning a helper
    let err = broker
        .login("/", &mut negotiate_headers(None), None)
        .await
        .unwrap_err();
    match err {
        Error::AuthenticationFailed(m) => assert!(m.contains("GSSAPI"), "{}", m),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 1);
}

#[tokio::test]
async fn e2e_negotiate_failure_echoes_gssapi_output() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"error":"authentication-failed","gssapi-output":"746f6b656e"}\n' >&3
"#,
    );
    let broker = broker(config_with_helper("negotiate", &command));

    let mut headers = negotiate_headers(Some("aW5wdXQ="));
    let err = broker.login("/", &mut headers, None).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)), "{:?}", err);
    assert_eq!(headers.get("WWW-Authenticate"), Some("Negotiate dG9rZW4="));
}

#[tokio::test]
async fn e2e_negotiate_without_token_starts_handshake() {
    // with no client token the helper still gets a (single, empty) frame
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"error":"authentication-failed","gssapi-output":""}\n' >&3
"#,
    );
    let broker = broker(config_with_helper("negotiate", &command));

    let mut headers = negotiate_headers(None);
    let err = broker.login("/", &mut headers, None).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)), "{:?}", err);
    assert_eq!(headers.get("WWW-Authenticate"), Some("Negotiate"));
}

#[tokio::test]
async fn e2e_insecure_cookie_option() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"user":"alice"}\n' >&3
exec cat
"#,
    );
    let broker = authgate::broker::Broker::new(
        config_with_helper("basic", &command),
        authgate::broker::BrokerOptions {
            cookie_insecure: true,
            ..Default::default()
        },
    )
    .unwrap();

    let mut headers = basic_headers("alice", "secret");
    broker.login("/", &mut headers, None).await.unwrap();
    let set_cookie = headers.get("Set-Cookie").unwrap();
    assert!(!set_cookie.contains("Secure"));
    assert!(set_cookie.contains("HttpOnly"));
}

#[tokio::test]
async fn e2e_scheme_section_overrides_action() {
    // basic can be disabled outright
    let mut cfg = authgate::config::Config::default();
    cfg.schemes.insert(
        "basic".to_string(),
        SchemeConfig {
            action: Some("none".to_string()),
            ..Default::default()
        },
    );
    let broker = broker(cfg);

    let err = broker
        .login("/", &mut basic_headers("alice", "secret"), None)
        .await
        .unwrap_err();
    match err {
        Error::AuthenticationFailed(m) => assert!(m.contains("disabled"), "{}", m),
        other => panic!("unexpected error: {:?}", other),
    }
}
