use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinHandle,
};
use tracing::{debug, debug_span, warn, Instrument};

use super::error::Result;
use crate::forward::Relay;

/// Listens for forward frames and answers each through the relay.
pub struct Endpoint {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl Endpoint {
    pub async fn bind<A: ToSocketAddrs>(addr: A, relay: Relay) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            relay: Arc::new(relay),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the task is dropped. Every connection is
    /// served in its own task.
    pub async fn run(self) -> Result<()> {
        let local = self.local_addr()?;
        let span = debug_span!("endpoint", local = %local);
        self.accept_loop(local).instrument(span).await
    }

    async fn accept_loop(self, local: SocketAddr) -> Result<()> {
        debug!("accepting forward requests");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // usually fd exhaustion, which clears up as in-flight
                    // connections finish
                    warn!("accept on {} failed: {}", local, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let relay = self.relay.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = serve(stream, &relay).await {
                        warn!("dropping connection: {}", e);
                    }
                }
                .instrument(debug_span!("conn", peer = %peer)),
            );
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}

async fn serve(mut stream: TcpStream, relay: &Relay) -> Result<()> {
    let codec = relay.codec();
    let frame = codec.read_frame(&mut stream).await?;
    let reply = relay.handle_frame(&frame).await?;
    codec.write_frame(&mut stream, &reply).await
}
