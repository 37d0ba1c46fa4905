use std::time::{Duration, Instant};

use bytes::Bytes;
use rstest::{fixture, rstest};
use serde_json::json;
use vephor::{setup_local_tracing, AppResult, JsonbMessage, NetworkConfig, NetworkManager};

#[fixture]
#[once]
fn setup() {
    // another test binary thread may have installed it already
    let _ = setup_local_tracing(0);
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn connected_pair() -> AppResult<(NetworkManager, NetworkManager)> {
    let server = NetworkManager::new(NetworkConfig::default())?;
    server.connect_server(false, 0)?;
    let port = server.listen_port().expect("listening");
    let client = NetworkManager::new(NetworkConfig::default())?;
    client.connect_client(true, "127.0.0.1", port)?;
    assert!(wait_until(|| server.connection_ids().len() == 1));
    Ok((server, client))
}

fn collect(manager: &NetworkManager, n: usize) -> Vec<JsonbMessage> {
    let mut received = Vec::new();
    wait_until(|| {
        received.extend(manager.get_incoming_jsonb_messages_from_all());
        received.len() >= n
    });
    received
}

#[rstest]
fn test_client_message_reaches_server(_setup: ()) -> AppResult<()> {
    let (server, client) = connected_pair()?;
    let server_conn = server.connection_ids()[0];

    assert!(client.send_jsonb_message_to_all(&json!({"from": "client"}), &[]));
    let received = collect(&server, 1);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].header["from"], "client");
    assert_eq!(received[0].conn_id(), Some(server_conn));
    Ok(())
}

#[rstest]
fn test_payloads_survive_the_wire(_setup: ()) -> AppResult<()> {
    let (server, client) = connected_pair()?;
    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let payloads = vec![Bytes::new(), Bytes::from_static(b"abc"), Bytes::from(big)];
    let header = json!({"type": "scene", "data": {"nested": [1, 2.5, "x", null, true]}});
    client.send_jsonb_message(client.connection_ids()[0], header.clone(), payloads.clone())?;

    let received = collect(&server, 1);
    assert_eq!(received.len(), 1);
    let mut expected = header;
    expected["conn_id"] = json!(server.connection_ids()[0]);
    assert_eq!(received[0].header, expected);
    assert_eq!(received[0].payloads, payloads);
    Ok(())
}

#[rstest]
fn test_drain_keeps_arrival_order(_setup: ()) -> AppResult<()> {
    let (server, client) = connected_pair()?;
    let conn = server.connection_ids()[0];
    for i in 0..20 {
        server.send_jsonb_message(conn, json!({"seq": i}), vec![])?;
    }

    let received = collect(&client, 20);
    let seqs: Vec<i64> = received
        .iter()
        .filter_map(|msg| msg.header["seq"].as_i64())
        .collect();
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    assert!(client.get_incoming_jsonb_messages_from_all().is_empty());
    Ok(())
}

#[rstest]
fn test_server_sees_every_client(_setup: ()) -> AppResult<()> {
    let server = NetworkManager::new(NetworkConfig::default())?;
    server.connect_server(false, 0)?;
    let port = server.listen_port().expect("listening");

    let first = NetworkManager::new(NetworkConfig::default())?;
    first.connect_client(true, "127.0.0.1", port)?;
    let second = NetworkManager::new(NetworkConfig::default())?;
    second.connect_client(true, "127.0.0.1", port)?;
    assert!(wait_until(|| server.connection_ids().len() == 2));

    assert!(server.send_jsonb_message_to_all(&json!({"type": "flags"}), &[]));
    assert_eq!(collect(&first, 1).len(), 1);
    assert_eq!(collect(&second, 1).len(), 1);
    Ok(())
}
