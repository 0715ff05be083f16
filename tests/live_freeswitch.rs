//! Integration tests against a live FreeSWITCH instance.
//!
//! These tests require FreeSWITCH ESL on 127.0.0.1:8022 with password ClueCon.
//! Run with: cargo test --test live_freeswitch -- --ignored

use std::time::Duration;

use freeswitch_esl_engine::{
    Applications, EslError, Inbound, InboundConfig, PooledMessage, ReplyStatus,
};
use tokio::sync::mpsc;

const ESL_ADDR: &str = "127.0.0.1:8022";
const ESL_PASSWORD: &str = "ClueCon";

async fn connect(apps: Applications) -> Inbound {
    let config = InboundConfig::new(ESL_ADDR, ESL_PASSWORD)
        .with_dial_timeout(Duration::from_secs(5))
        .with_max_reconnect(1);
    Inbound::run(config, apps)
        .await
        .expect("failed to connect to FreeSWITCH")
}

/// Connect with an event callback that forwards every event to a channel.
async fn connect_with_events() -> (Inbound, mpsc::UnboundedReceiver<PooledMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let apps = Applications::new().on_event(move |msg| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
        }
    });
    (connect(apps).await, rx)
}

async fn recv_event(
    rx: &mut mpsc::UnboundedReceiver<PooledMessage>,
    name: &str,
    within: Duration,
) -> PooledMessage {
    tokio::time::timeout(within, async {
        loop {
            let msg = rx
                .recv()
                .await
                .expect("event channel closed");
            if msg.header("Event-Name") == Some(name) {
                return msg;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timeout waiting for {}", name))
}

#[tokio::test]
#[ignore]
async fn live_connect_and_status() {
    let inbound = connect(Applications::default()).await;
    assert!(inbound
        .connection()
        .is_ready());

    let resp = inbound
        .api("status", "")
        .await;
    let body = resp
        .reply_text()
        .expect("status should have body");
    assert!(body.contains("UP"), "expected UP in status: {}", body);
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_subscribe_and_recv_heartbeat() {
    let (inbound, mut events) = connect_with_events().await;

    assert!(inbound
        .event("plain HEARTBEAT")
        .await
        .is_success());

    let event = recv_event(&mut events, "HEARTBEAT", Duration::from_secs(25)).await;
    assert!(event
        .header("Core-UUID")
        .is_some());
    assert!(
        event
            .headers()
            .get_int("Event-Sequence")
            .unwrap()
            > 0
    );
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_api_multiple_commands() {
    let inbound = connect(Applications::default()).await;

    let version = inbound
        .api("version", "")
        .await;
    assert!(version
        .reply_text()
        .unwrap_or_default()
        .contains("FreeSWITCH"));

    let hostname = inbound
        .api("hostname", "")
        .await;
    assert!(!hostname
        .reply_text()
        .unwrap_or_default()
        .is_empty());

    let domain = inbound
        .api("global_getvar", "domain")
        .await;
    assert!(!domain
        .reply_text()
        .unwrap_or_default()
        .is_empty());
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_concurrent_commands_are_serialized() {
    let inbound = connect(Applications::default()).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let inbound = inbound.clone();
        handles.push(tokio::spawn(async move {
            let reply = inbound
                .api("eval", &format!("marker-{}", i))
                .await;
            (i, reply.reply_text().map(str::to_string))
        }));
    }
    for handle in handles {
        let (i, text) = handle
            .await
            .unwrap();
        assert_eq!(text, Some(format!("marker-{}", i)));
    }
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_reply_status_ok() {
    let inbound = connect(Applications::default()).await;
    let reply = inbound
        .event("plain ALL")
        .await;
    assert_eq!(reply.status(), ReplyStatus::Ok);
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_reply_status_err() {
    let inbound = connect(Applications::default()).await;
    let reply = inbound
        .send_raw("bogus_command_that_does_not_exist")
        .await;
    assert_eq!(reply.status(), ReplyStatus::Err);
    assert!(matches!(
        reply.into_result(),
        Err(EslError::CommandFailed { .. })
    ));
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_api_err_body() {
    let inbound = connect(Applications::default()).await;
    let reply = inbound
        .api("nonexistent_api_command", "")
        .await;
    assert_eq!(reply.status(), ReplyStatus::Err);
    assert!(reply
        .reply_text()
        .unwrap_or_default()
        .starts_with("-ERR"));
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_bgapi_background_job() {
    let (inbound, mut events) = connect_with_events().await;
    assert!(inbound
        .event("plain BACKGROUND_JOB")
        .await
        .is_success());

    let reply = inbound
        .bgapi("status", "")
        .await;
    assert!(reply.is_success());
    let job_uuid = reply
        .job_uuid()
        .expect("bgapi reply should carry a Job-UUID")
        .to_string();

    let event = recv_event(&mut events, "BACKGROUND_JOB", Duration::from_secs(5)).await;
    assert_eq!(event.header("Job-UUID"), Some(job_uuid.as_str()));
    assert!(String::from_utf8_lossy(event.inner_body()).contains("UP"));
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_noevents_stops_delivery() {
    let (inbound, mut events) = connect_with_events().await;
    assert!(inbound
        .event("plain CUSTOM esl_test::noevents")
        .await
        .is_success());
    assert!(inbound
        .send_raw("noevents")
        .await
        .is_success());

    while events
        .try_recv()
        .is_ok()
    {}
    let _ = inbound
        .api("status", "")
        .await;
    assert!(tokio::time::timeout(Duration::from_millis(500), events.recv())
        .await
        .is_err());
    inbound.close();
}

#[tokio::test]
#[ignore]
async fn live_close_and_wait() {
    let inbound = connect(Applications::default()).await;
    let conn = inbound.connection();
    inbound.close();
    inbound
        .wait()
        .await
        .unwrap();
    assert!(inbound.is_closed());
    assert!(!conn.is_ready());
    assert!(matches!(
        inbound
            .api("status", "")
            .await
            .into_result(),
        Err(EslError::ConnectionClosed | EslError::NotConnected)
    ));
}
