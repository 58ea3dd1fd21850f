use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use tokio::sync::{mpsc, RwLock};

use kvguard_core::connection::{
    Command, RemoteMessage, Reply, SubscriptionHandle, SubscriptionTarget, Transport,
};
use kvguard_core::{KvError, Result};

use super::error::map_redis_error;

/// Keys requested per SCAN round trip.
const SCAN_COUNT: usize = 100;

/// Redis transport holding the command and publisher connections.
pub struct RedisTransport {
    client: redis::Client,
    commands: RwLock<Option<ConnectionManager>>,
    publisher: RwLock<Option<MultiplexedConnection>>,
}

impl RedisTransport {
    /// Creates a transport for `url` without connecting.
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379/0")
    ///
    /// # Errors
    ///
    /// Returns `KvError::Configuration` if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| KvError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            commands: RwLock::new(None),
            publisher: RwLock::new(None),
        })
    }

    async fn command_connection(&self) -> Result<ConnectionManager> {
        self.commands
            .read()
            .await
            .clone()
            .ok_or_else(|| KvError::Connectivity("not connected".to_string()))
    }

    async fn publisher_connection(&self) -> Result<MultiplexedConnection> {
        self.publisher
            .read()
            .await
            .clone()
            .ok_or_else(|| KvError::Connectivity("not connected".to_string()))
    }

    async fn scan(&self, conn: &mut ConnectionManager, pattern: &str) -> Result<Reply> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(conn)
                .await
                .map_err(map_redis_error)?;
            keys.extend(batch.into_iter().map(Reply::Bulk));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(Reply::Array(keys))
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<()> {
        let commands = ConnectionManager::new(self.client.clone())
            .await
            .map_err(map_redis_error)?;
        let publisher = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;

        *self.commands.write().await = Some(commands);
        *self.publisher.write().await = Some(publisher);
        Ok(())
    }

    async fn execute(&self, command: Command) -> Result<Reply> {
        let mut conn = self.command_connection().await?;
        if let Command::Scan { pattern } = &command {
            return self.scan(&mut conn, pattern).await;
        }
        let value: redis::Value = to_redis_cmd(&command)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(from_redis_value(value))
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        // SCAN needs its own cursor loop and cannot be batched.
        if commands.iter().any(|c| matches!(c, Command::Scan { .. })) {
            let mut replies = Vec::with_capacity(commands.len());
            for command in commands {
                replies.push(self.execute(command).await?);
            }
            return Ok(replies);
        }

        let mut conn = self.command_connection().await?;
        let mut pipe = redis::pipe();
        for command in &commands {
            pipe.add_command(to_redis_cmd(command));
        }
        let values: Vec<redis::Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(values.into_iter().map(from_redis_value).collect())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.publisher_connection().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(map_redis_error)
    }

    async fn subscribe(
        &self,
        target: SubscriptionTarget,
        sink: mpsc::UnboundedSender<RemoteMessage>,
    ) -> Result<SubscriptionHandle> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_redis_error)?;

        match &target {
            SubscriptionTarget::Channel(channel) => pubsub.subscribe(channel).await,
            SubscriptionTarget::Pattern(pattern) => pubsub.psubscribe(pattern).await,
        }
        .map_err(map_redis_error)?;

        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let message = RemoteMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload: msg.get_payload_bytes().to_vec(),
                };
                if sink.send(message).is_err() {
                    break;
                }
            }
            tracing::info!(target = %target, "Redis subscription stream ended");
        });

        Ok(SubscriptionHandle::new(move || task.abort()))
    }

    async fn close(&self) {
        self.commands.write().await.take();
        self.publisher.write().await.take();
    }
}

/// Builds the Redis command for a backend-agnostic [`Command`].
fn to_redis_cmd(command: &Command) -> redis::Cmd {
    match command {
        Command::Ping => redis::cmd("PING"),
        Command::Get { key } => {
            let mut cmd = redis::cmd("GET");
            cmd.arg(key);
            cmd
        }
        Command::Set {
            key,
            value,
            ttl_seconds,
        } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value.as_slice());
            if let Some(ttl) = ttl_seconds.filter(|ttl| *ttl > 0) {
                cmd.arg("EX").arg(ttl);
            }
            cmd
        }
        Command::Del { keys } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(keys);
            cmd
        }
        Command::Exists { key } => {
            let mut cmd = redis::cmd("EXISTS");
            cmd.arg(key);
            cmd
        }
        Command::Expire { key, seconds } => {
            let mut cmd = redis::cmd("EXPIRE");
            cmd.arg(key).arg(*seconds);
            cmd
        }
        Command::Scan { pattern } => {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(0).arg("MATCH").arg(pattern);
            cmd
        }
        Command::SetAdd { key, member } => {
            let mut cmd = redis::cmd("SADD");
            cmd.arg(key).arg(member);
            cmd
        }
        Command::SetRemove { key, member } => {
            let mut cmd = redis::cmd("SREM");
            cmd.arg(key).arg(member);
            cmd
        }
        Command::SetMembers { key } => {
            let mut cmd = redis::cmd("SMEMBERS");
            cmd.arg(key);
            cmd
        }
        Command::Info { section } => {
            let mut cmd = redis::cmd("INFO");
            if let Some(section) = section {
                cmd.arg(section);
            }
            cmd
        }
        Command::ConfigSet { parameter, value } => {
            let mut cmd = redis::cmd("CONFIG");
            cmd.arg("SET").arg(parameter).arg(value);
            cmd
        }
    }
}

fn from_redis_value(value: redis::Value) -> Reply {
    match value {
        redis::Value::Nil => Reply::Nil,
        redis::Value::Okay => Reply::Ok,
        redis::Value::Int(n) => Reply::Integer(n),
        redis::Value::BulkString(bytes) => Reply::Bulk(bytes),
        redis::Value::SimpleString(text) => Reply::Status(text),
        redis::Value::VerbatimString { text, .. } => Reply::Bulk(text.into_bytes()),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Reply::Array(items.into_iter().map(from_redis_value).collect())
        }
        redis::Value::Boolean(flag) => Reply::Integer(i64::from(flag)),
        other => Reply::Status(format!("{:?}", other)),
    }
}
