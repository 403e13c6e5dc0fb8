// Integration test for the admission throttle: a saturated broker refuses
// new attempts before any driver runs.

use authgate::broker::Broker;
use authgate::error::Error;
use std::sync::Arc;

#[path = "common/broker.rs"]
mod common;
use common::*;

#[tokio::test]
async fn e2e_throttle_rejects_when_full() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
sleep 5
printf '{"user":"alice"}\n' >&3
"#,
    );
    let mut cfg = config_with_helper("basic", &command);
    cfg.web_service.max_startups = Some("1".to_string());
    // keep the parked first attempt short-lived
    let section = cfg.schemes.get_mut("basic").unwrap();
    section.timeout = Some("1".to_string());
    section.response_timeout = Some("1".to_string());
    let broker = Arc::new(broker(cfg));

    let first = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .login("/", &mut basic_headers("alice", "secret"), None)
                .await
        })
    };

    assert!(
        wait_until(3, || broker.in_flight() == 1).await,
        "first attempt never entered the dispatcher"
    );

    let err = broker
        .login("/", &mut basic_headers("bob", "secret"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Throttled), "{:?}", err);
    assert_eq!(err.to_string(), "Connection closed by host");

    // the first attempt times out against the stalled helper
    let first = first.await.unwrap();
    assert!(first.is_err());
    assert_eq!(broker.in_flight(), 0);

    // with the slot free again, admission succeeds (and fails on the
    // helper, not the throttle)
    let err = broker
        .login("/", &mut basic_headers("carol", "secret"), None)
        .await
        .unwrap_err();
    assert!(!matches!(err, Error::Throttled), "{:?}", err);
}

#[tokio::test]
async fn e2e_throttle_disabled_with_zero_max() {
    let (_dir, command) = helper_script(
        r#"read -r payload <&3
printf '{"user":"alice"}\n' >&3
exec cat
"#,
    );
    let mut cfg = config_with_helper("basic", &command);
    cfg.web_service.max_startups = Some("0:100:0".to_string());
    let broker = Broker::new(cfg, Default::default()).unwrap();

    let outcome = broker
        .login("/", &mut basic_headers("alice", "secret"), None)
        .await;
    assert!(outcome.is_ok());
}
