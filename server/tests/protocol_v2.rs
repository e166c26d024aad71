//! End-to-end tests of the V2 wire protocol, driven through the client sdk
//! over real sockets.

use std::time::Duration;

use bytes::Bytes;
use emberq::{Command, Connection, FrameType, IdentifyConfig, Message};
use emberq_server::app::BrokerApp;
use emberq_server::broker::Channel;
use emberq_server::core::config::BrokerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

fn test_config() -> BrokerConfig {
    BrokerConfig {
        tcp_address: "127.0.0.1:0".to_string(),
        http_address: "127.0.0.1:0".to_string(),
        queue_scan_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn start_broker(config: BrokerConfig) -> BrokerApp {
    BrokerApp::start(config).await.expect("broker failed to start")
}

async fn read_frame(conn: &mut Connection) -> emberq::Frame {
    timeout(Duration::from_secs(2), conn.read_frame())
        .await
        .expect("timed out waiting for frame")
        .expect("read failed")
}

async fn expect_message(conn: &mut Connection) -> Message {
    timeout(Duration::from_secs(2), conn.read_message())
        .await
        .expect("timed out waiting for message")
        .expect("read failed")
}

/// SUB is processed asynchronously from the test's point of view; wait for
/// the channel to appear on the server.
async fn wait_for_channel(app: &BrokerApp, topic: &str, channel: &str) -> std::sync::Arc<Channel> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if let Some(ch) = app
            .broker
            .get_topic(topic)
            .and_then(|t| t.get_channel(channel))
        {
            return ch;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "channel never appeared"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_basic_publish_subscribe() {
    let app = start_broker(test_config()).await;

    let topic = app.broker.get_or_create_topic("test_basic");
    let msg = app.broker.new_message(Bytes::from_static(b"test body"));
    let expected_id = msg.id;
    topic.put(msg).unwrap();

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(&Command::subscribe("test_basic", "ch", "test", "test.local"))
        .await
        .unwrap();
    conn.send(&Command::ready(1)).await.unwrap();

    let out = expect_message(&mut conn).await;
    assert_eq!(out.id, expected_id);
    assert_eq!(&out.body[..], b"test body");
    assert_eq!(out.attempts, 1);
}

#[tokio::test]
async fn test_multiple_consumers_separate_channels() {
    let app = start_broker(test_config()).await;

    let topic = app.broker.get_or_create_topic("test_multiple");
    topic.get_or_create_channel("ch1");
    topic.get_or_create_channel("ch2");
    let msg = app.broker.new_message(Bytes::from_static(b"test body"));
    let expected_id = msg.id;
    topic.put(msg).unwrap();

    for channel in ["ch1", "ch2"] {
        let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
        conn.send(&Command::subscribe("test_multiple", channel, "test", "test.local"))
            .await
            .unwrap();
        conn.send(&Command::ready(1)).await.unwrap();

        let out = expect_message(&mut conn).await;
        assert_eq!(out.id, expected_id);
        assert_eq!(&out.body[..], b"test body");
        assert_eq!(out.attempts, 1);
    }
}

#[tokio::test]
async fn test_heartbeat_and_nop_reset() {
    let app = start_broker(test_config()).await;

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(
        &Command::identify(&IdentifyConfig {
            short_id: "test".into(),
            long_id: "test.local".into(),
            heartbeat_interval: Some(30),
        })
        .unwrap(),
    )
    .await
    .unwrap();

    let frame = read_frame(&mut conn).await;
    assert_eq!(frame.frame_type, FrameType::Response);
    assert_eq!(&frame.data[..], b"OK");

    conn.send(&Command::subscribe("test_hb", "ch", "test", "test.local"))
        .await
        .unwrap();

    // idle for one interval: a heartbeat arrives
    let frame = read_frame(&mut conn).await;
    assert_eq!(frame.frame_type, FrameType::Response);
    assert_eq!(&frame.data[..], b"_heartbeat_");

    // NOP resets the countdown and the connection stays healthy
    conn.send(&Command::nop()).await.unwrap();
    let frame = read_frame(&mut conn).await;
    assert_eq!(&frame.data[..], b"_heartbeat_");
}

#[tokio::test]
async fn test_unresponsive_client_is_disconnected() {
    let config = BrokerConfig {
        client_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let app = start_broker(config).await;

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(&Command::subscribe("test_timeout", "ch", "test", "test.local"))
        .await
        .unwrap();

    // heartbeats go unanswered; the server closes the connection and any
    // subsequent read fails
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection was never closed"
        );
        match timeout(Duration::from_millis(200), conn.read_frame()).await {
            Ok(Ok(_heartbeat)) => continue,
            Ok(Err(_)) => break,
            Err(_) => continue,
        }
    }
}

#[tokio::test]
async fn test_pause_holds_messages_and_preserves_order() {
    let app = start_broker(test_config()).await;

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(&Command::subscribe("test_pause", "ch", "test", "test.local"))
        .await
        .unwrap();
    conn.send(&Command::ready(1)).await.unwrap();

    let channel = wait_for_channel(&app, "test_pause", "ch").await;
    channel.pause();

    let topic = app.broker.get_or_create_topic("test_pause");
    topic
        .put(app.broker.new_message(Bytes::from_static(b"test body1")))
        .unwrap();

    // paused: nothing may arrive
    assert!(
        timeout(Duration::from_millis(50), conn.read_frame())
            .await
            .is_err(),
        "received a frame from a paused channel"
    );

    channel.unpause();
    topic
        .put(app.broker.new_message(Bytes::from_static(b"test body2")))
        .unwrap();

    // the first published message is delivered first
    let out = expect_message(&mut conn).await;
    assert_eq!(&out.body[..], b"test body1");
}

#[tokio::test]
async fn test_requeue_with_delay_redelivers() {
    let app = start_broker(test_config()).await;

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(&Command::subscribe("test_requeue", "ch", "test", "test.local"))
        .await
        .unwrap();
    conn.send(&Command::ready(1)).await.unwrap();

    let topic = app.broker.get_or_create_topic("test_requeue");
    topic
        .put(app.broker.new_message(Bytes::from_static(b"test body")))
        .unwrap();

    let first = expect_message(&mut conn).await;
    assert_eq!(first.attempts, 1);

    conn.send(&Command::requeue(&first.id, 100)).await.unwrap();
    conn.send(&Command::ready(1)).await.unwrap();

    // the delay has not elapsed yet
    assert!(
        timeout(Duration::from_millis(50), conn.read_frame())
            .await
            .is_err(),
        "redelivered before the requeue delay elapsed"
    );

    let second = expect_message(&mut conn).await;
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempts, 2);
}

#[tokio::test]
async fn test_finish_after_requeue_fails() {
    let app = start_broker(test_config()).await;

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(&Command::subscribe("test_fin_req", "ch", "test", "test.local"))
        .await
        .unwrap();
    conn.send(&Command::ready(1)).await.unwrap();

    let topic = app.broker.get_or_create_topic("test_fin_req");
    topic
        .put(app.broker.new_message(Bytes::from_static(b"test body")))
        .unwrap();

    let msg = expect_message(&mut conn).await;
    conn.send(&Command::requeue(&msg.id, 5000)).await.unwrap();
    conn.send(&Command::finish(&msg.id)).await.unwrap();

    let frame = read_frame(&mut conn).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(&frame.data[..], b"E_FIN_FAILED");
}

#[tokio::test]
async fn test_cls_answers_close_wait() {
    let app = start_broker(test_config()).await;

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(&Command::subscribe("test_cls", "ch", "test", "test.local"))
        .await
        .unwrap();
    conn.send(&Command::close()).await.unwrap();

    let frame = read_frame(&mut conn).await;
    assert_eq!(frame.frame_type, FrameType::Response);
    assert_eq!(&frame.data[..], b"CLOSE_WAIT");

    // a closing client gets no further deliveries
    let topic = app.broker.get_or_create_topic("test_cls");
    topic
        .put(app.broker.new_message(Bytes::from_static(b"late")))
        .unwrap();
    assert!(
        timeout(Duration::from_millis(50), conn.read_frame())
            .await
            .is_err(),
        "received a delivery while closing"
    );
}

#[tokio::test]
async fn test_mpub_delivers_batch_in_order() {
    let app = start_broker(test_config()).await;

    let mut publisher = Connection::connect(app.tcp_addr).await.unwrap();
    // subscribe first so the batch has somewhere to land
    let mut consumer = Connection::connect(app.tcp_addr).await.unwrap();
    consumer
        .send(&Command::subscribe("test_mpub", "ch", "test", "test.local"))
        .await
        .unwrap();
    consumer.send(&Command::ready(3)).await.unwrap();
    wait_for_channel(&app, "test_mpub", "ch").await;

    publisher
        .send(&Command::mpublish("test_mpub", &[b"one", b"two", b"three"]))
        .await
        .unwrap();
    let frame = read_frame(&mut publisher).await;
    assert_eq!(frame.frame_type, FrameType::Response);
    assert_eq!(&frame.data[..], b"OK");

    for body in [b"one".as_slice(), b"two", b"three"] {
        let msg = expect_message(&mut consumer).await;
        assert_eq!(&msg.body[..], body);
        consumer.send(&Command::finish(&msg.id)).await.unwrap();
    }
}

#[tokio::test]
async fn test_pub_roundtrip_over_the_wire() {
    let app = start_broker(test_config()).await;

    let mut publisher = Connection::connect(app.tcp_addr).await.unwrap();
    publisher
        .send(&Command::publish("test_pub", b"wire body"))
        .await
        .unwrap();
    let frame = read_frame(&mut publisher).await;
    assert_eq!(&frame.data[..], b"OK");

    let mut consumer = Connection::connect(app.tcp_addr).await.unwrap();
    consumer
        .send(&Command::subscribe("test_pub", "ch", "test", "test.local"))
        .await
        .unwrap();
    consumer.send(&Command::ready(1)).await.unwrap();

    let msg = expect_message(&mut consumer).await;
    assert_eq!(&msg.body[..], b"wire body");
}

#[tokio::test]
async fn test_sub_invalid_topic_name() {
    let app = start_broker(test_config()).await;

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(&Command::subscribe("bad#topic", "ch", "test", "test.local"))
        .await
        .unwrap();

    let frame = read_frame(&mut conn).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(&frame.data[..], b"E_BAD_TOPIC");
}

#[tokio::test]
async fn test_bad_protocol_magic_is_rejected() {
    let app = start_broker(test_config()).await;

    let mut socket = tokio::net::TcpStream::connect(app.tcp_addr).await.unwrap();
    socket.write_all(b"  V9").await.unwrap();

    let size = socket.read_u32().await.unwrap();
    let frame_type = socket.read_u32().await.unwrap();
    let mut data = vec![0u8; size as usize - 4];
    socket.read_exact(&mut data).await.unwrap();

    assert_eq!(frame_type, 1); // error frame
    assert_eq!(&data[..], b"E_BAD_PROTOCOL");
}

#[tokio::test]
async fn test_ephemeral_channel_removed_on_last_disconnect() {
    let app = start_broker(test_config()).await;

    let mut conn = Connection::connect(app.tcp_addr).await.unwrap();
    conn.send(&Command::subscribe(
        "test_eph",
        "tail#ephemeral",
        "test",
        "test.local",
    ))
    .await
    .unwrap();
    wait_for_channel(&app, "test_eph", "tail#ephemeral").await;

    drop(conn);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let gone = app
            .broker
            .get_topic("test_eph")
            .map(|t| t.get_channel("tail#ephemeral").is_none())
            .unwrap_or(true);
        if gone {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ephemeral channel was not cleaned up"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
