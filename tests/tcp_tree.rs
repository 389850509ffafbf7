use std::{sync::Arc, time::Duration};

use arbor::{
    net::wire::{ForwardHeader, FrameCodec, WireNode, PROTOCOL_VERSION},
    Endpoint, ErrorCode, ForwardConfig, Forwarder, NodeAddr, NodeStatus, Relay, Reply, Request,
    RequestHandler, TcpTransport, Transport,
};
use async_trait::async_trait;
use tokio::net::TcpListener;

struct Status(String);

#[async_trait]
impl RequestHandler for Status {
    async fn handle(&self, request: &Request) -> (Reply, i32) {
        match request {
            Request::NodeStatus => (
                Reply::NodeStatus(NodeStatus {
                    hostname: self.0.clone(),
                    cpus: 2,
                    load_milli: 10,
                    free_mem_mb: 512,
                    uptime_secs: 1,
                }),
                0,
            ),
            _ => (Reply::Pong, 0),
        }
    }
}

fn config() -> ForwardConfig {
    ForwardConfig::builder()
        .fanout(3)
        .timeout(Duration::from_secs(5))
        .hop_overhead(Duration::from_millis(50))
        .build()
}

fn forwarder(config: &ForwardConfig) -> Forwarder {
    let transport = Arc::new(TcpTransport::from_config(config));
    Forwarder::new(config.clone(), transport).unwrap()
}

async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

#[tokio::test]
async fn loopback_tree_reports_every_node() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = config();
    let mut targets = Vec::new();
    for i in 1..=10 {
        let name = format!("node{:02}", i);
        let relay = Relay::new(
            Arc::new(forwarder(&config)),
            Arc::new(Status(name.clone())),
        );
        let endpoint = Endpoint::bind("127.0.0.1:0", relay).await.unwrap();
        let addr = endpoint.local_addr().unwrap().to_string();
        endpoint.spawn();
        targets.push(NodeAddr::new(name, addr));
    }
    targets.push(NodeAddr::new("node11", dead_addr().await));

    let list = forwarder(&config)
        .dispatch(targets.clone(), Request::NodeStatus)
        .await
        .unwrap()
        .forward_wait()
        .await;

    assert_eq!(list.len(), 11);
    let summary = list.summary();
    assert_eq!(summary.succeeded, 10, "{}", summary);
    assert_eq!(summary.connect_failures, 1);
    assert_eq!(list.get("node11").unwrap().error, ErrorCode::ConnectFailure);
    for target in &targets[..10] {
        match &list.get(&target.name).unwrap().payload {
            Some(Reply::NodeStatus(status)) => assert_eq!(status.hostname, target.name),
            other => panic!("unexpected payload for {}: {:?}", target.name, other),
        }
    }
}

async fn spawn_node(config: &ForwardConfig, name: &str) -> String {
    let relay = Relay::new(Arc::new(forwarder(config)), Arc::new(Status(name.to_string())));
    let endpoint = Endpoint::bind("127.0.0.1:0", relay).await.unwrap();
    let addr = endpoint.local_addr().unwrap().to_string();
    endpoint.spawn();
    addr
}

fn header(version: u16, request: Vec<u8>) -> ForwardHeader {
    ForwardHeader {
        version,
        dispatch_id: 42,
        target: "edge".into(),
        timeout_us: 1_000_000,
        subtree: vec![WireNode {
            name: "below".into(),
            addr: "127.0.0.1:9".into(),
            span: 1,
        }],
        aliases: vec![],
        aliases_expire_at: None,
        request,
    }
}

#[tokio::test]
async fn undecodable_request_comes_back_as_protocol_errors() {
    let config = config();
    let codec = FrameCodec::from_config(&config);
    let addr = spawn_node(&config, "edge").await;

    let frame = codec
        .encode_forward(&header(PROTOCOL_VERSION, vec![0xff; 8]))
        .unwrap();
    let reply = TcpTransport::from_config(&config)
        .send(&addr, frame, Duration::from_secs(2))
        .await
        .unwrap();
    let bundle = codec.decode_reply(&reply).unwrap();
    assert_eq!(bundle.dispatch_id, 42);
    assert_eq!(bundle.entries.len(), 2);
    for entry in &bundle.entries {
        assert_eq!(entry.error, u16::from(ErrorCode::ProtocolError), "{}", entry.node);
    }
}

#[tokio::test]
async fn rejected_frame_is_not_reported_as_unreachable() {
    let config = config();
    let codec = FrameCodec::from_config(&config);
    let addr = spawn_node(&config, "edge").await;

    let request = Request::Ping.encode().unwrap();
    let frame = codec
        .encode_forward(&header(PROTOCOL_VERSION + 1, request))
        .unwrap();
    let err = TcpTransport::from_config(&config)
        .send(&addr, frame, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::ProtocolError, "{}", err);
}
