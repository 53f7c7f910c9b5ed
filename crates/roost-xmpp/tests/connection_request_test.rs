//! End-to-end connection request tests: client-originated and bus-originated
//! wake requests with success, busy, timeout and offline outcomes.

mod common;

use std::time::Duration;

use common::{next_published, RawXmppClient, TestServer, DEFAULT_TIMEOUT};
use roost_xmpp::bus::{BusDelivery, HEADER_ENDPOINT_ID, HEADER_METHOD, HEADER_TASK_ID, HEADER_TOPIC_ID};
use roost_xmpp::{AccountConfig, XmppServerConfig};

const WAKE_DEV1: &str = "<iq xmlns='jabber:client' type='get' id='cr001' to='dev1@localhost/roost'>\
    <connectionRequest xmlns='urn:broadband-forum-org:cwmp:xmppConnReq-1-0'>\
    <username>acs</username><password>cr-secret</password>\
    </connectionRequest></iq>";

const DEVICE_ACK: &str = "<iq xmlns='jabber:client' type='result' id='cr001' to='admin@localhost/roost'/>";

const DEVICE_BUSY: &str = "<iq xmlns='jabber:client' type='error' id='cr001' to='admin@localhost/roost'>\
    <error type='wait'><resource-constraint xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>";

async fn expect_wake(device: &mut RawXmppClient) -> String {
    device
        .read_until("</connectionRequest>", DEFAULT_TIMEOUT)
        .await
        .expect("Device never received the wake request")
}

fn connreq_delivery(endpoint: &str, task: &str) -> BusDelivery {
    BusDelivery::with_headers([
        (HEADER_METHOD, "connreq"),
        (HEADER_ENDPOINT_ID, endpoint),
        (HEADER_TASK_ID, task),
        (HEADER_TOPIC_ID, "acs-acks"),
    ])
}

#[tokio::test]
async fn test_client_request_success() {
    let server = TestServer::start().await;
    let mut device = server.login("dev1", "roost").await;
    let mut admin = server.login("admin", "roost").await;

    admin.send(WAKE_DEV1).await.unwrap();

    let wake = expect_wake(&mut device).await;
    assert!(wake.contains("from='admin@localhost/roost'"));
    assert!(wake.contains("<username>acs</username>"));
    assert!(wake.contains("<password>cr-secret</password>"));

    device.send(DEVICE_ACK).await.unwrap();

    let outcome = admin.read_until("id='cr001'", DEFAULT_TIMEOUT).await.unwrap();
    assert!(outcome.contains("type='result'"));
    assert!(!outcome.contains("<error"));
    assert_eq!(server.accounts.pending_request_count(), 0);
}

#[tokio::test]
async fn test_client_request_busy() {
    let server = TestServer::start().await;
    let mut device = server.login("dev1", "roost").await;
    let mut admin = server.login("admin", "roost").await;

    admin.send(WAKE_DEV1).await.unwrap();
    expect_wake(&mut device).await;
    device.send(DEVICE_BUSY).await.unwrap();

    let outcome = admin.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(outcome.contains("type='error'"));
    assert!(outcome.contains("resource-constraint"));
}

#[tokio::test]
async fn test_client_request_offline_target() {
    let server = TestServer::start().await;
    let mut admin = server.login("admin", "roost").await;

    admin
        .send("<iq xmlns='jabber:client' type='get' id='cr001' to='dev9@localhost/roost'/>")
        .await
        .unwrap();

    let outcome = admin.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(outcome.contains("recipient-unavailable"));
    assert!(!server.accounts.has_pending_request(&"dev9@localhost".parse().unwrap()));
}

#[tokio::test]
async fn test_client_request_timeout() {
    let account = AccountConfig {
        connection_request_timeout: Duration::from_millis(300),
        ..common::test_account_config()
    };
    let server = TestServer::start_with(account, XmppServerConfig::default()).await;
    let mut device = server.login("dev1", "roost").await;
    let mut admin = server.login("admin", "roost").await;

    admin.send(WAKE_DEV1).await.unwrap();
    expect_wake(&mut device).await;

    let outcome = admin.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(outcome.contains("remote-server-timeout"));
    assert_eq!(server.accounts.pending_request_count(), 0);

    // A late answer is harmless.
    device.send(DEVICE_ACK).await.unwrap();
    admin.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_bus_request_acknowledged() {
    let server = TestServer::start().await;
    let mut acks = server.subscribe();
    let mut device = server.login("dev1", "roost").await;

    server.bus.deliver(connreq_delivery("dev1", "task-17")).await.unwrap();

    let wake = expect_wake(&mut device).await;
    assert!(wake.contains("from='admin@localhost/roost'"));
    assert!(wake.contains("to='dev1@localhost/roost'"));
    assert!(wake.contains("<username>admin</username>"));

    device.send(DEVICE_ACK).await.unwrap();

    let ack = next_published(&mut acks, "acs-acks", DEFAULT_TIMEOUT).await;
    assert_eq!(ack["Id"], "task-17");
    assert_eq!(ack["From"], "roost-node");
    assert_eq!(ack["To"], "dev1");
    assert!(ack.get("Error").is_none());
}

#[tokio::test]
async fn test_bus_request_busy() {
    let server = TestServer::start().await;
    let mut acks = server.subscribe();
    let mut device = server.login("dev1", "roost").await;

    server.bus.deliver(connreq_delivery("dev1", "task-18")).await.unwrap();
    expect_wake(&mut device).await;
    device.send(DEVICE_BUSY).await.unwrap();

    let ack = next_published(&mut acks, "acs-acks", DEFAULT_TIMEOUT).await;
    assert_eq!(ack["Id"], "task-18");
    assert_eq!(ack["Error"], "busy");
}

#[tokio::test]
async fn test_bus_request_offline() {
    let server = TestServer::start().await;
    let mut acks = server.subscribe();

    server.bus.deliver(connreq_delivery("dev9", "task-19")).await.unwrap();

    let ack = next_published(&mut acks, "acs-acks", DEFAULT_TIMEOUT).await;
    assert_eq!(ack["Id"], "task-19");
    assert_eq!(ack["To"], "dev9");
    assert_eq!(ack["Error"], "offline");
}

#[tokio::test]
async fn test_bus_request_timeout() {
    let account = AccountConfig {
        connection_request_timeout: Duration::from_millis(300),
        ..common::test_account_config()
    };
    let server = TestServer::start_with(account, XmppServerConfig::default()).await;
    let mut acks = server.subscribe();
    let mut device = server.login("dev1", "roost").await;

    server.bus.deliver(connreq_delivery("dev1", "task-20")).await.unwrap();
    expect_wake(&mut device).await;

    let ack = next_published(&mut acks, "acs-acks", DEFAULT_TIMEOUT).await;
    assert_eq!(ack["Id"], "task-20");
    assert_eq!(ack["Error"], "timeout");
}

#[tokio::test]
async fn test_other_bus_methods_ignored() {
    let server = TestServer::start().await;
    let mut device = server.login("dev1", "roost").await;

    server
        .bus
        .deliver(BusDelivery::with_headers([
            (HEADER_METHOD, "reboot"),
            (HEADER_ENDPOINT_ID, "dev1"),
        ]))
        .await
        .unwrap();

    device.expect_silence(Duration::from_millis(300)).await;
    assert_eq!(server.accounts.pending_request_count(), 0);
}
