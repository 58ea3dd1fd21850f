use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use kvguard_core::connection::{
    Command, RemoteMessage, Reply, SubscriptionHandle, SubscriptionTarget, Transport,
};
use kvguard_core::{KvError, Result};

use super::server::LoopbackServer;

const DISCONNECTED: u64 = u64::MAX;

/// A client connection to a [`LoopbackServer`].
pub struct LoopbackTransport {
    server: Arc<LoopbackServer>,
    /// Server generation this transport connected in.
    connected_in: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(server: Arc<LoopbackServer>) -> Self {
        Self {
            server,
            connected_in: AtomicU64::new(DISCONNECTED),
        }
    }

    pub fn server(&self) -> &Arc<LoopbackServer> {
        &self.server
    }

    /// Fails unless the server is up and has not restarted since connect.
    fn check(&self) -> Result<()> {
        let connected_in = self.connected_in.load(Ordering::SeqCst);
        if connected_in == DISCONNECTED {
            return Err(KvError::Connectivity("not connected".to_string()));
        }
        if !self.server.is_available() || connected_in != self.server.generation() {
            return Err(KvError::Connectivity("connection reset by peer".to_string()));
        }
        Ok(())
    }

    async fn round_trip(&self) -> Result<()> {
        self.check()?;
        let latency = self.server.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
            self.check()?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self) -> Result<()> {
        if !self.server.is_available() {
            return Err(KvError::Connectivity("connection refused".to_string()));
        }
        self.connected_in
            .store(self.server.generation(), Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, command: Command) -> Result<Reply> {
        self.round_trip().await?;
        self.server.handle(command)
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        self.round_trip().await?;
        commands
            .into_iter()
            .map(|command| self.server.handle(command))
            .collect()
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.round_trip().await?;
        self.server.publish(channel, payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        target: SubscriptionTarget,
        sink: mpsc::UnboundedSender<RemoteMessage>,
    ) -> Result<SubscriptionHandle> {
        self.round_trip().await?;
        let id = self.server.subscribe(target, sink);
        let server: Weak<LoopbackServer> = Arc::downgrade(&self.server);
        Ok(SubscriptionHandle::new(move || {
            if let Some(server) = server.upgrade() {
                server.unsubscribe(id);
            }
        }))
    }

    async fn close(&self) {
        self.connected_in.store(DISCONNECTED, Ordering::SeqCst);
    }
}
