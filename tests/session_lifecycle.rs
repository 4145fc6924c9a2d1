//! End-to-end session lifecycle against an in-process MQTT 3.1.1 broker

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use sms_relay::broker::{BrokerError, BrokerSession, ConnectionState, TOPIC};
use sms_relay::carrier::{CarrierError, CarrierGateway};
use sms_relay::config::{BrokerConfig, Config};
use sms_relay::credentials::{CredentialStore, Credentials, MemoryCredentialStore};
use sms_relay::indicator::LogIndicator;
use sms_relay::status::StatusBus;
use sms_relay::supervisor::{StartOutcome, Supervisor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(5);

/// What the broker saw, tagged with the 1-based connection number
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Connect {
        conn: usize,
        client_id: String,
        username: String,
    },
    Subscribe {
        conn: usize,
        topic: String,
    },
    Publish {
        conn: usize,
        topic: String,
        payload: Vec<u8>,
    },
    Disconnect {
        conn: usize,
    },
}

#[derive(Debug)]
enum Control {
    /// Send the CONNACK that was held back
    ConnAck,
    /// Deliver a QoS 0 PUBLISH to the client
    Publish(String, Vec<u8>),
    /// Drop the TCP connection without a word
    Kill,
}

struct FakeBroker {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<mpsc::UnboundedSender<Control>>,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl FakeBroker {
    /// `hold_reconnect_connack`: every connection after the first waits for
    /// [`Control::ConnAck`] before it is accepted
    async fn start(hold_reconnect_connack: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conns_tx, conns) = mpsc::unbounded_channel();
        let (seen_tx, seen) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut conn = 0;
            while let Ok((stream, _)) = listener.accept().await {
                conn += 1;
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                let _ = conns_tx.send(control_tx);
                let hold = hold_reconnect_connack && conn > 1;
                tokio::spawn(serve(conn, stream, hold, control_rx, seen_tx.clone()));
            }
        });

        Self { addr, conns, seen }
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn next_conn(&mut self) -> mpsc::UnboundedSender<Control> {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection")
            .expect("broker gone")
    }

    async fn next_seen(&mut self) -> Seen {
        timeout(WAIT, self.seen.recv())
            .await
            .expect("broker saw nothing")
            .expect("broker gone")
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Option<(u8, Vec<u8>)> {
    let header = reader.read_u8().await.ok()?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await.ok()?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

fn read_str(body: &[u8], at: &mut usize) -> String {
    let len = u16::from_be_bytes([body[*at], body[*at + 1]]) as usize;
    let s = String::from_utf8_lossy(&body[*at + 2..*at + 2 + len]).to_string();
    *at += 2 + len;
    s
}

/// (client id, username) from a CONNECT body
fn parse_connect(body: &[u8]) -> (String, String) {
    let mut at = 0;
    let _protocol = read_str(body, &mut at);
    let flags = body[at + 1];
    at += 4;
    let client_id = read_str(body, &mut at);
    if flags & 0x04 != 0 {
        read_str(body, &mut at);
        read_str(body, &mut at);
    }
    let username = if flags & 0x80 != 0 {
        read_str(body, &mut at)
    } else {
        String::new()
    };
    (client_id, username)
}

fn put_remaining_len(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn publish_packet(topic: &str, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(0x30);
    put_remaining_len(&mut buf, 2 + topic.len() + payload.len());
    buf.put_u16(topic.len() as u16);
    buf.put_slice(topic.as_bytes());
    buf.put_slice(payload);
    buf
}

async fn serve(
    conn: usize,
    stream: tokio::net::TcpStream,
    hold_connack: bool,
    mut control: mpsc::UnboundedReceiver<Control>,
    seen: mpsc::UnboundedSender<Seen>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (packets_tx, mut packets) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(packet) = read_packet(&mut reader).await {
            if packets_tx.send(packet).is_err() {
                break;
            }
        }
    });

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    loop {
        tokio::select! {
            packet = packets.recv() => {
                let Some((header, body)) = packet else { break };
                match header >> 4 {
                    1 => {
                        let (client_id, username) = parse_connect(&body);
                        let _ = seen.send(Seen::Connect { conn, client_id, username });
                        if !hold_connack && writer.write_all(&CONNACK).await.is_err() {
                            break;
                        }
                    }
                    3 => {
                        let qos = (header >> 1) & 0x03;
                        let mut at = 0;
                        let topic = read_str(&body, &mut at);
                        let pkid = if qos > 0 {
                            at += 2;
                            Some([body[at - 2], body[at - 1]])
                        } else {
                            None
                        };
                        let payload = body[at..].to_vec();
                        let _ = seen.send(Seen::Publish { conn, topic, payload });
                        if let Some([hi, lo]) = pkid {
                            let _ = writer.write_all(&[0x40, 0x02, hi, lo]).await;
                        }
                    }
                    8 => {
                        let mut at = 2;
                        let topic = read_str(&body, &mut at);
                        // Topics under silent/ never get an answer
                        let answer = !topic.starts_with("silent/");
                        let _ = seen.send(Seen::Subscribe { conn, topic });
                        if answer {
                            let suback = [0x90, 0x03, body[0], body[1], 0x00];
                            let _ = writer.write_all(&suback).await;
                        }
                    }
                    12 => {
                        let _ = writer.write_all(&[0xD0, 0x00]).await;
                    }
                    14 => {
                        let _ = seen.send(Seen::Disconnect { conn });
                        break;
                    }
                    _ => {}
                }
            }
            command = control.recv() => {
                match command {
                    Some(Control::ConnAck) => {
                        let _ = writer.write_all(&CONNACK).await;
                    }
                    Some(Control::Publish(topic, payload)) => {
                        let _ = writer.write_all(&publish_packet(&topic, &payload)).await;
                    }
                    Some(Control::Kill) | None => break,
                }
            }
        }
    }
}

struct ChannelGateway {
    sent: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl CarrierGateway for ChannelGateway {
    fn max_part_len(&self) -> usize {
        160
    }

    async fn send_segment(&self, destination: &str, body: &str) -> Result<(), CarrierError> {
        let _ = self.sent.send((destination.to_string(), body.to_string()));
        Ok(())
    }
}

struct Harness {
    supervisor: Supervisor,
    store: Arc<MemoryCredentialStore>,
    status: Arc<StatusBus>,
    sent: mpsc::UnboundedReceiver<(String, String)>,
}

fn harness(credentials: Credentials) -> Harness {
    let mut config = Config::default();
    config.broker.connect_timeout_secs = 5;
    config.broker.reconnect_delay_ms = 100;
    config.relay.pacing_ms = 10;

    let store = Arc::new(MemoryCredentialStore::new(credentials));
    let status = Arc::new(StatusBus::new());
    let (tx, sent) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(
        config,
        store.clone(),
        status.clone(),
        Arc::new(ChannelGateway { sent: tx }),
        Arc::new(LogIndicator),
    );

    Harness {
        supervisor,
        store,
        status,
        sent,
    }
}

async fn wait_status(status: &StatusBus, wanted: bool) {
    let mut rx = status.watch();
    timeout(WAIT, rx.wait_for(|current| *current == wanted))
        .await
        .expect("status never changed")
        .expect("status bus gone");
}

#[tokio::test]
async fn test_start_subscribes_and_reports_status() {
    let mut broker = FakeBroker::start(false).await;
    let h = harness(Credentials::new(broker.endpoint(), "artemis", "pw"));

    assert_eq!(assert_ok!(h.supervisor.start().await), StartOutcome::Started);

    match broker.next_seen().await {
        Seen::Connect {
            conn, client_id, ..
        } => {
            assert_eq!(conn, 1);
            assert!(client_id.starts_with("artemis-relay-client-"));
        }
        other => panic!("Expected CONNECT, got {:?}", other),
    }
    assert_eq!(
        broker.next_seen().await,
        Seen::Subscribe {
            conn: 1,
            topic: TOPIC.to_string()
        }
    );
    wait_status(&h.status, true).await;
    assert!(h.supervisor.is_running().await);

    h.supervisor.stop().await;
    assert_eq!(broker.next_seen().await, Seen::Disconnect { conn: 1 });
    assert!(!h.status.current());
    assert!(!h.supervisor.is_running().await);
}

#[tokio::test]
async fn test_start_twice_keeps_one_connection() {
    let mut broker = FakeBroker::start(false).await;
    let h = harness(Credentials::new(broker.endpoint(), "artemis", "pw"));

    assert_eq!(assert_ok!(h.supervisor.start().await), StartOutcome::Started);
    let _conn = broker.next_conn().await;
    wait_status(&h.status, true).await;

    assert_eq!(
        assert_ok!(h.supervisor.start().await),
        StartOutcome::AlreadyRunning
    );
    assert!(h.status.current());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(broker.conns.try_recv().is_err());

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_resubscribes_once() {
    let mut broker = FakeBroker::start(true).await;
    let h = harness(Credentials::new(broker.endpoint(), "artemis", "pw"));

    assert_ok!(h.supervisor.start().await);
    let first = broker.next_conn().await;
    wait_status(&h.status, true).await;
    // CONNECT + SUBSCRIBE on the first connection
    broker.next_seen().await;
    broker.next_seen().await;

    first.send(Control::Kill).unwrap();
    wait_status(&h.status, false).await;

    let second = broker.next_conn().await;
    assert!(matches!(
        broker.next_seen().await,
        Seen::Connect { conn: 2, .. }
    ));
    // Reconnected at the TCP level but not acknowledged: still down
    assert!(!h.status.current());

    second.send(Control::ConnAck).unwrap();
    assert_eq!(
        broker.next_seen().await,
        Seen::Subscribe {
            conn: 2,
            topic: TOPIC.to_string()
        }
    );
    wait_status(&h.status, true).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(broker.seen.try_recv().is_err());
    assert!(h.supervisor.is_running().await);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_inbound_envelope_reaches_carrier() {
    let mut broker = FakeBroker::start(false).await;
    let mut h = harness(Credentials::new(broker.endpoint(), "artemis", "pw"));

    assert_ok!(h.supervisor.start().await);
    let conn = broker.next_conn().await;
    wait_status(&h.status, true).await;

    conn.send(Control::Publish(
        "sms".to_string(),
        br#"{"phoneNumber":"+15551234567","message":"hi"}"#.to_vec(),
    ))
    .unwrap();
    conn.send(Control::Publish("sms".to_string(), b"{not json".to_vec()))
        .unwrap();
    conn.send(Control::Publish(
        "sms".to_string(),
        br#"{"phoneNumber":"+15557654321","message":"second"}"#.to_vec(),
    ))
    .unwrap();

    let first = timeout(WAIT, h.sent.recv()).await.unwrap().unwrap();
    assert_eq!(first, ("+15551234567".to_string(), "hi".to_string()));
    let second = timeout(WAIT, h.sent.recv()).await.unwrap().unwrap();
    assert_eq!(second, ("+15557654321".to_string(), "second".to_string()));

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_restart_uses_current_credentials() {
    let mut broker = FakeBroker::start(false).await;
    let h = harness(Credentials::new(broker.endpoint(), "alice", "pw"));

    assert_ok!(h.supervisor.start().await);
    assert!(matches!(
        broker.next_seen().await,
        Seen::Connect { ref username, .. } if username == "alice"
    ));
    broker.next_seen().await;

    h.store
        .save(&Credentials::new(broker.endpoint(), "bob", "pw2"))
        .unwrap();
    h.supervisor.stop().await;
    assert_eq!(broker.next_seen().await, Seen::Disconnect { conn: 1 });

    assert_eq!(assert_ok!(h.supervisor.start().await), StartOutcome::Started);
    match broker.next_seen().await {
        Seen::Connect {
            conn,
            client_id,
            username,
        } => {
            assert_eq!(conn, 2);
            assert_eq!(username, "bob");
            assert!(client_id.starts_with("bob-relay-client-"));
        }
        other => panic!("Expected CONNECT, got {:?}", other),
    }

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_empty_credentials_never_touch_the_broker() {
    let mut broker = FakeBroker::start(false).await;
    let h = harness(Credentials::default());

    assert!(h.supervisor.start().await.is_err());
    assert!(!h.status.current());
    assert!(!h.supervisor.is_running().await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.conns.try_recv().is_err());
}

fn broker_config(offline_buffer: usize) -> BrokerConfig {
    BrokerConfig {
        connect_timeout_secs: 1,
        reconnect_delay_ms: 100,
        offline_buffer,
        ..BrokerConfig::default()
    }
}

/// Session subscribed on connection 1, whose link was then cut; connection 2
/// is waiting for its held-back CONNACK
async fn session_gone_offline(
    broker: &mut FakeBroker,
    offline_buffer: usize,
) -> (BrokerSession, Arc<StatusBus>, mpsc::UnboundedSender<Control>) {
    let status = Arc::new(StatusBus::new());
    let mut session = BrokerSession::new(broker_config(offline_buffer), status.clone(), None);
    let credentials = Credentials::new(broker.endpoint(), "artemis", "pw");

    assert_ok!(session.connect(&credentials).await);
    let first = broker.next_conn().await;
    wait_status(&status, true).await;
    assert!(matches!(broker.next_seen().await, Seen::Connect { conn: 1, .. }));
    assert!(matches!(broker.next_seen().await, Seen::Subscribe { conn: 1, .. }));

    first.send(Control::Kill).unwrap();
    wait_status(&status, false).await;
    let second = broker.next_conn().await;
    assert!(matches!(broker.next_seen().await, Seen::Connect { conn: 2, .. }));

    (session, status, second)
}

#[tokio::test]
async fn test_offline_buffer_fails_fast_and_flushes_in_order() {
    let mut broker = FakeBroker::start(true).await;
    let (mut session, status, second) = session_gone_offline(&mut broker, 3).await;

    for i in 0..3 {
        assert_ok!(session.publish("sms/outbox", format!("queued-{}", i)));
    }
    assert_eq!(
        session.publish("sms/outbox", "overflow"),
        Err(BrokerError::BufferFull)
    );

    second.send(Control::ConnAck).unwrap();

    let mut delivered = Vec::new();
    while delivered.len() < 3 {
        if let Seen::Publish { conn, payload, .. } = broker.next_seen().await {
            assert_eq!(conn, 2);
            delivered.push(String::from_utf8(payload).unwrap());
        }
    }
    assert_eq!(delivered, vec!["queued-0", "queued-1", "queued-2"]);

    wait_status(&status, true).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(seen) = broker.seen.try_recv() {
        assert!(
            !matches!(seen, Seen::Publish { .. }),
            "unexpected publish {:?}",
            seen
        );
    }

    assert_ok!(session.disconnect().await);
}

#[tokio::test]
async fn test_full_offline_buffer_does_not_block_resubscribe() {
    let mut broker = FakeBroker::start(true).await;
    let (mut session, status, second) = session_gone_offline(&mut broker, 3).await;

    let results: Vec<_> = (0..5)
        .map(|i| session.publish("sms/outbox", format!("queued-{}", i)))
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert_eq!(results[4], Err(BrokerError::BufferFull));

    second.send(Control::ConnAck).unwrap();

    let mut subscribes = 0;
    let mut publishes = 0;
    while subscribes == 0 || publishes < 3 {
        match broker.next_seen().await {
            Seen::Subscribe { conn, topic } => {
                assert_eq!((conn, topic.as_str()), (2, TOPIC));
                subscribes += 1;
            }
            Seen::Publish { .. } => publishes += 1,
            other => panic!("Unexpected {:?}", other),
        }
    }
    wait_status(&status, true).await;
    assert_eq!(session.state(), ConnectionState::Subscribed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(broker.seen.try_recv().is_err());

    assert_ok!(session.disconnect().await);
}

#[tokio::test]
async fn test_unanswered_subscribe_times_out_without_confusing_later_ones() {
    let mut broker = FakeBroker::start(false).await;
    let status = Arc::new(StatusBus::new());
    let mut session = BrokerSession::new(broker_config(10), status.clone(), None);
    let credentials = Credentials::new(broker.endpoint(), "artemis", "pw");

    assert_ok!(session.connect(&credentials).await);
    wait_status(&status, true).await;

    assert_eq!(
        session.subscribe("silent/void").await,
        Err(BrokerError::SubscribeTimeout("silent/void".to_string()))
    );

    // The next SUBACK belongs to this subscribe, not the abandoned one
    assert_ok!(session.subscribe("sms/extra").await);
    assert_ok!(session.subscribe("sms/extra").await);

    assert_ok!(session.disconnect().await);
}
