use std::{sync::Arc, time::Duration};

use arbor::{
    AliasTable, Endpoint, ErrorCode, ForwardConfig, Forwarder, NodeAddr, NodeStatus, Relay, Reply,
    Request, RequestHandler, TcpTransport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::net::TcpListener;
use tracing::info;

const NODES: usize = 12;

struct DemoHandler {
    hostname: String,
    booted: DateTime<Utc>,
}

#[async_trait]
impl RequestHandler for DemoHandler {
    async fn handle(&self, request: &Request) -> (Reply, i32) {
        let reply = match request {
            Request::Ping => Reply::Pong,
            Request::NodeStatus => {
                let mut rng = rand::thread_rng();
                Reply::NodeStatus(NodeStatus {
                    hostname: self.hostname.clone(),
                    cpus: 16,
                    load_milli: rng.gen_range(0..16_000),
                    free_mem_mb: rng.gen_range(1_024..65_536),
                    uptime_secs: (Utc::now() - self.booted).num_seconds().max(0) as u64,
                })
            }
            Request::Signal {
                job_id, step_id, ..
            } => Reply::Signalled {
                job_id: *job_id,
                step_id: *step_id,
                tasks: 1,
            },
            Request::Kill { job_id, step_id } => Reply::Killed {
                job_id: *job_id,
                step_id: *step_id,
            },
        };
        (reply, 0)
    }
}

fn forwarder(config: &ForwardConfig) -> Forwarder {
    let transport = Arc::new(TcpTransport::from_config(config));
    Forwarder::new(config.clone(), transport).unwrap()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = ForwardConfig::builder()
        .fanout(3)
        .timeout(Duration::from_secs(2))
        .hop_overhead(Duration::from_millis(50))
        .build();
    let booted = Utc::now();

    let mut targets = Vec::with_capacity(NODES);
    let mut real_addr = None;
    for i in 1..=NODES {
        let name = format!("cn{:03}", i);
        if i == NODES {
            // nothing listens here
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            targets.push(NodeAddr::new(name, addr.to_string()));
            continue;
        }

        let relay = Relay::new(
            Arc::new(forwarder(&config)),
            Arc::new(DemoHandler {
                hostname: name.clone(),
                booted,
            }),
        );
        let endpoint = Endpoint::bind("127.0.0.1:0", relay).await.unwrap();
        let addr = endpoint.local_addr().unwrap().to_string();
        endpoint.spawn();

        if i == NODES - 1 {
            // advertised under a stale address, reachable only through the alias
            real_addr = Some(addr);
            targets.push(NodeAddr::new(name, "127.0.0.1:9"));
        } else {
            targets.push(NodeAddr::new(name, addr));
        }
    }

    let root = forwarder(&config);
    if let Some(addr) = real_addr {
        let alias = format!("cn{:03}", NODES - 1);
        info!("aliasing {} to {}", alias, addr);
        let table = AliasTable::new(Utc::now() + chrono::Duration::seconds(30)).with(alias, addr);
        root.set_alias_addresses(table).await;
    }

    let job = root.dispatch(targets, Request::NodeStatus).await.unwrap();
    info!("dispatch {} started, {:?} budget", job.id(), root.config().timeout);
    let list = job.forward_wait().await;

    for entry in &list {
        match (&entry.error, &entry.payload) {
            (ErrorCode::Success, Some(Reply::NodeStatus(status))) => println!(
                "{:<8} ok     load {:>5.2} free {:>6} MiB up {}s",
                entry.node,
                status.load_milli as f64 / 1000.0,
                status.free_mem_mb,
                status.uptime_secs
            ),
            (error, _) => println!("{:<8} {}", entry.node, error),
        }
    }
    println!("{}", list.summary());
}
