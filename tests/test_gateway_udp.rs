//! End-to-end forwarding over real UDP sockets
//!
//! The broker side is replaced by a channel feeding the gateway, except for
//! the `Gateway::run` test which runs against an unreachable broker.

use mqttsn_gateway::protocol::{decode, encode, Connack, Message, Puback, QoS, Regack, ReturnCode};
use mqttsn_gateway::session::PendingPublish;
use mqttsn_gateway::{Gateway, GatewayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestGateway {
    client: UdpSocket,
    gateway_addr: SocketAddr,
    publishes: mpsc::Sender<PendingPublish>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<mqttsn_gateway::GatewayResult<()>>,
}

impl TestGateway {
    async fn start(max_qos: u8) -> Self {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let gateway_addr = socket.local_addr().unwrap();

        let config = GatewayConfig::from_toml_str(&format!(
            r#"
[gateway]
gateway_id = "gw-test"
retry_period_secs = 1

[broker]
broker_url = "mqtt://localhost:1883"

[[clients]]
client_id = "node-1"
address = "{}"
topics = ["cmd/+"]
max_qos = {max_qos}
"#,
            client.local_addr().unwrap()
        ))
        .unwrap();

        let (publishes, publish_rx) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let gateway = Gateway::new(config);
        let task =
            tokio::spawn(async move { gateway.serve(socket, publish_rx, shutdown_rx).await });

        Self {
            client,
            gateway_addr,
            publishes,
            shutdown,
            task,
        }
    }

    async fn recv(&self) -> Message {
        let mut buf = [0u8; 512];
        let (len, from) = timeout(RECV_TIMEOUT, self.client.recv_from(&mut buf))
            .await
            .expect("no datagram from gateway")
            .unwrap();
        assert_eq!(from, self.gateway_addr);
        decode(&buf[..len]).unwrap()
    }

    async fn send(&self, message: &Message) {
        self.send_raw(&encode(message).unwrap()).await;
    }

    async fn send_raw(&self, datagram: &[u8]) {
        self.client
            .send_to(datagram, self.gateway_addr)
            .await
            .unwrap();
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("gateway did not stop")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_broker_publish_is_registered_then_delivered() {
    let gw = TestGateway::start(1).await;

    gw.publishes
        .send(PendingPublish::new(
            "cmd/led",
            "on",
            QoS::AtLeastOnce,
        ))
        .await
        .unwrap();

    let register = match gw.recv().await {
        Message::Register(register) => register,
        other => panic!("expected REGISTER, got {other:?}"),
    };
    assert_eq!(register.topic_name, "cmd/led");

    gw.send(&Message::Regack(Regack {
        topic_id: register.topic_id,
        msg_id: register.msg_id,
        return_code: ReturnCode::Accepted,
    }))
    .await;

    let publish = match gw.recv().await {
        Message::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    };
    assert_eq!(publish.topic_id, register.topic_id);
    assert_eq!(publish.flags.qos_bits, 0b01);
    assert_eq!(&publish.data[..], b"on");

    gw.send(&Message::Puback(Puback {
        topic_id: publish.topic_id,
        msg_id: publish.msg_id,
        return_code: ReturnCode::Accepted,
    }))
    .await;

    gw.stop().await;
}

#[tokio::test]
async fn test_delivery_qos_is_capped_and_unmatched_topics_skipped() {
    let gw = TestGateway::start(0).await;

    gw.publishes
        .send(PendingPublish::new(
            "other/topic",
            "ignored",
            QoS::AtMostOnce,
        ))
        .await
        .unwrap();
    gw.publishes
        .send(PendingPublish::new(
            "cmd/fan",
            "max",
            QoS::ExactlyOnce,
        ))
        .await
        .unwrap();

    let register = match gw.recv().await {
        Message::Register(register) => register,
        other => panic!("expected REGISTER, got {other:?}"),
    };
    assert_eq!(register.topic_name, "cmd/fan");
    gw.send(&Message::Regack(Regack {
        topic_id: register.topic_id,
        msg_id: register.msg_id,
        return_code: ReturnCode::Accepted,
    }))
    .await;

    match gw.recv().await {
        Message::Publish(publish) => {
            assert_eq!(publish.flags.qos_bits, 0);
            assert_eq!(&publish.data[..], b"max");
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }

    gw.stop().await;
}

#[tokio::test]
async fn test_session_restarts_on_connect_after_disconnect() {
    let gw = TestGateway::start(1).await;

    gw.send_raw(&[0x02, 0x18]).await;
    assert_eq!(
        gw.recv().await,
        Message::Disconnect(Default::default())
    );

    // Give the ended session time to release its channel
    tokio::time::sleep(Duration::from_millis(50)).await;

    // CONNECT: flags, protocol id, duration, client id
    let mut connect = vec![0x00, 0x04, 0x04, 0x01, 0x00, 0x3C];
    connect.extend_from_slice(b"node-1");
    connect[0] = connect.len() as u8;
    gw.send_raw(&connect).await;

    assert_eq!(
        gw.recv().await,
        Message::Connack(Connack {
            return_code: ReturnCode::Accepted
        })
    );

    gw.stop().await;
}

#[tokio::test]
async fn test_garbage_datagram_does_not_stop_gateway() {
    let gw = TestGateway::start(1).await;

    gw.send_raw(&[0xFF, 0x00]).await;
    gw.send_raw(&[0x02, 0x16]).await;

    assert_eq!(gw.recv().await, Message::Pingresp);
    gw.stop().await;
}

#[tokio::test]
async fn test_run_with_unreachable_broker_stops_on_shutdown() {
    let config = GatewayConfig::from_toml_str(
        r#"
[gateway]
gateway_id = "gw-run"
bind_address = "127.0.0.1:0"

[broker]
broker_url = "mqtt://127.0.0.1:1"

[[clients]]
client_id = "node-1"
address = "127.0.0.1:20001"
topics = ["cmd/+"]
"#,
    )
    .unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(Gateway::new(config).run(shutdown_rx));

    // Long enough for the bridge to fail at least once and back off
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!task.is_finished());

    shutdown.send(true).unwrap();
    let result = timeout(RECV_TIMEOUT, task)
        .await
        .expect("gateway did not stop")
        .unwrap();
    assert!(result.is_ok(), "run failed: {result:?}");
}
