//! Redis Streams-backed task queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `taskforge:tasks` (one stream for every notification)
//! - **Consumer group**: `taskforge.workers`; each worker is a named consumer
//! - **Redelivery**: entries left pending longer than `claim_idle` (worker
//!   crashed, or skipped without ack) are taken over with `XAUTOCLAIM`
//! - **Ack**: `XACK` with the stream entry id carried as the delivery receipt
//!
//! Blocking reads hold their connection, so each consumer gets its own; the
//! publisher shares one multiplexed connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument, warn};

use taskforge_events::{Delivery, QueueError, TaskQueue, TaskQueued};

const DEFAULT_STREAM_KEY: &str = "taskforge:tasks";
const DEFAULT_GROUP: &str = "taskforge.workers";
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);
const PAYLOAD_FIELD: &str = "payload";

#[derive(Clone)]
pub struct RedisStreamsTaskQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    claim_idle: Duration,
    publisher: Arc<OnceCell<MultiplexedConnection>>,
    consumers: Arc<Mutex<HashMap<String, MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisStreamsTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsTaskQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("claim_idle", &self.claim_idle)
            .finish_non_exhaustive()
    }
}

fn transport(context: &str, e: redis::RedisError) -> QueueError {
    QueueError::Transport(format!("{context} failed: {e}"))
}

impl RedisStreamsTaskQueue {
    /// `redis_url` e.g. `redis://localhost:6379`. No connection is made yet.
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        group: Option<String>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| transport("open", e))?;
        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            group: group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            claim_idle: DEFAULT_CLAIM_IDLE,
            publisher: Arc::new(OnceCell::new()),
            consumers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    /// Create the stream and consumer group if missing (idempotent).
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.publisher().await?;
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(transport("XGROUP CREATE", e)),
        }
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, QueueError> {
        self.publisher
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| transport("connect", e))
            })
            .await
            .cloned()
    }

    async fn consumer_connection(&self, consumer: &str) -> Result<MultiplexedConnection, QueueError> {
        let mut consumers = self.consumers.lock().await;
        if let Some(conn) = consumers.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| transport("connect", e))?;
        consumers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    /// Take over one entry another consumer left pending for too long.
    async fn reclaim(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Option<(String, String)>, QueueError> {
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| transport("XAUTOCLAIM", e))?;

        let Some(entries) = reply.get(1) else {
            return Ok(None);
        };
        let entries: Vec<Option<(String, HashMap<String, String>)>> =
            redis::from_redis_value(entries).map_err(|e| transport("XAUTOCLAIM reply", e))?;
        Ok(entries
            .into_iter()
            .flatten()
            .find_map(|(id, mut fields)| fields.remove(PAYLOAD_FIELD).map(|payload| (id, payload))))
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<(String, String)>, QueueError> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(wait.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| transport("XREADGROUP", e))?;

        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .find_map(|entry| {
                let payload: Option<String> = entry.get(PAYLOAD_FIELD);
                payload.map(|p| (entry.id, p))
            }))
    }

    async fn ack_id(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.publisher().await?;
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("XACK", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskQueue for RedisStreamsTaskQueue {
    #[instrument(
        skip(self, message),
        fields(stream_key = %self.stream_key, task_id = %message.task_id, attempt = message.attempt),
        err
    )]
    async fn publish(&self, message: TaskQueued) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(&message).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.publisher().await?;

        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("task_id")
            .arg(message.task_id.to_string())
            .arg("tenant_id")
            .arg(message.tenant_id.as_str())
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("XADD", e))?;
        Ok(())
    }

    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.consumer_connection(consumer).await?;

        let entry = match self.reclaim(&mut conn, consumer).await? {
            Some(entry) => {
                debug!(consumer, entry_id = %entry.0, "reclaimed stale pending entry");
                Some(entry)
            }
            None => self.read_new(&mut conn, consumer, wait).await?,
        };
        let Some((id, payload)) = entry else {
            return Ok(None);
        };

        match serde_json::from_str::<TaskQueued>(&payload) {
            Ok(message) => Ok(Some(Delivery::with_receipt(message, id))),
            Err(e) => {
                // Poison entry: ack so it is not redelivered forever.
                warn!(entry_id = %id, error = %e, "dropping undecodable stream entry");
                self.ack_id(&id).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        match &delivery.receipt {
            Some(id) => self.ack_id(id).await,
            None => Ok(()),
        }
    }
}
