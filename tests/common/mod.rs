//! Shared helpers for integration tests: embedded broker, publisher, SQLite queries

#![allow(dead_code)]

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Start an embedded rumqttd broker on a free local port and return the port
pub fn start_broker() -> u16 {
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let listen: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let router = RouterConfig {
        max_segment_size: 104857600,
        max_segment_count: 10,
        max_connections: 1000,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 262144,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    let config = Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    };

    thread::spawn(move || {
        let mut broker = Broker::new(config);
        let _ = broker.start();
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(listen).is_err() {
        assert!(Instant::now() < deadline, "broker did not start on {listen}");
        thread::sleep(Duration::from_millis(20));
    }
    port
}

/// Publish every payload to `topic` at QoS 1 and wait for all acks
pub async fn publish(port: u16, client_id: &str, topic: &str, payloads: &[String]) {
    if payloads.is_empty() {
        return;
    }
    let mut options = MqttOptions::new(client_id, "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    let expected = payloads.len();
    let poller = tokio::spawn(async move {
        let mut acked = 0;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::PubAck(_))) => {
                    acked += 1;
                    if acked == expected {
                        return acked;
                    }
                }
                Ok(_) => {}
                Err(e) => panic!("publisher failed: {e}"),
            }
        }
    });

    for payload in payloads {
        client.publish(topic, QoS::AtLeastOnce, false, payload.clone().into_bytes()).await.unwrap();
    }
    let acked = tokio::time::timeout(Duration::from_secs(10), poller).await.unwrap().unwrap();
    assert_eq!(acked, expected);
    let _ = client.try_disconnect();
}

/// Publish probes to `topic` until `table` in `database` receives one.
///
/// Returns once the service's subscriptions are live.
pub async fn wait_for_subscription(port: u16, topic: &str, database: &Path, table: &str) {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut attempt = 0;
    while messages(database, table).is_empty() {
        assert!(Instant::now() < deadline, "no probe reached {table}");
        attempt += 1;
        publish(port, &format!("probe-{attempt}"), topic, &[format!("probe {attempt}")]).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Messages stored in `table`, in insertion order
pub fn messages(database: &Path, table: &str) -> Vec<String> {
    let Ok(connection) = rusqlite::Connection::open(database) else {
        return Vec::new();
    };
    let _ = connection.busy_timeout(Duration::from_secs(5));
    let Ok(mut statement) = connection.prepare(&format!("SELECT Message FROM \"{table}\" ORDER BY id")) else {
        return Vec::new();
    };
    statement
        .query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
