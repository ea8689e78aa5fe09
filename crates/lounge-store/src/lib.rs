pub mod memory;
pub mod queries;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stored value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Key/value, hash, set and pub/sub primitives shared by every coordinator.
///
/// Backed by Redis when configured. Any remote failure, or no remote at all,
/// falls through to an in-process [`MemoryStore`] with the same semantics, so
/// callers never see which backend served them.
///
/// Each call goes to one backend as a single command or atomic pipeline.
/// Reads merge in whatever the local fallback holds and removals clear it,
/// so writes made while the remote was down stay visible after it returns.
#[derive(Clone)]
pub struct SharedStateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    remote: Option<RemoteStore>,
    local: MemoryStore,
    /// Local pub/sub bus: (topic, payload)
    local_bus: broadcast::Sender<(String, String)>,
}

struct RemoteStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl SharedStateStore {
    /// A store that only ever uses process memory.
    pub fn memory() -> Self {
        Self::build(None)
    }

    /// Connect to Redis at `url`. Failure is not fatal: the store degrades to
    /// process memory and logs why.
    pub async fn connect(url: &str) -> Self {
        match Self::try_connect(url).await {
            Ok(store) => store,
            Err(e) => {
                warn!("Shared store unreachable at {}, using local memory: {}", url, e);
                Self::memory()
            }
        }
    }

    pub async fn try_connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("Shared store connected to {}", url);
        Ok(Self::build(Some(RemoteStore { client, conn })))
    }

    fn build(remote: Option<RemoteStore>) -> Self {
        let (local_bus, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(StoreInner {
                remote,
                local: MemoryStore::new(),
                local_bus,
            }),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.inner.remote.is_some()
    }

    /// Run `op` against the remote backend. `None` means "use local memory",
    /// either because there is no remote or because the call failed.
    async fn with_remote<T, F, Fut>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let remote = self.inner.remote.as_ref()?;
        match f(remote.conn.clone()).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(op, "Shared store call failed, falling back to local memory: {}", e);
                None
            }
        }
    }

    // -- Hashes --

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) {
        let done = self
            .with_remote("hset", |mut c| async move { c.hset::<_, _, _, ()>(key, field, value).await })
            .await;
        if done.is_none() {
            self.inner.local.hash_set(key, field, value);
        }
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        let remote = self
            .with_remote("hget", |mut c| async move { c.hget::<_, _, Option<String>>(key, field).await })
            .await
            .flatten();
        remote.or_else(|| self.inner.local.hash_get(key, field))
    }

    /// Remote fields win over local ones of the same name.
    pub async fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        let mut all = self.inner.local.hash_get_all(key);
        if let Some(remote) = self
            .with_remote("hgetall", |mut c| async move {
                c.hgetall::<_, HashMap<String, String>>(key).await
            })
            .await
        {
            all.extend(remote);
        }
        all
    }

    pub async fn hash_del(&self, key: &str, field: &str) {
        self.with_remote("hdel", |mut c| async move { c.hdel::<_, _, ()>(key, field).await })
            .await;
        self.inner.local.hash_del(key, field);
    }

    // -- Sets --

    pub async fn set_add(&self, key: &str, member: &str) {
        let done = self
            .with_remote("sadd", |mut c| async move { c.sadd::<_, _, ()>(key, member).await })
            .await;
        if done.is_none() {
            self.inner.local.set_add(key, member);
        }
    }

    pub async fn set_remove(&self, key: &str, member: &str) {
        self.with_remote("srem", |mut c| async move { c.srem::<_, _, ()>(key, member).await })
            .await;
        self.inner.local.set_remove(key, member);
    }

    pub async fn set_is_member(&self, key: &str, member: &str) -> bool {
        let remote = self
            .with_remote("sismember", |mut c| async move {
                c.sismember::<_, _, bool>(key, member).await
            })
            .await;
        remote == Some(true) || self.inner.local.set_is_member(key, member)
    }

    pub async fn set_members(&self, key: &str) -> HashSet<String> {
        let mut members = self.inner.local.set_members(key);
        if let Some(remote) = self
            .with_remote("smembers", |mut c| async move {
                c.smembers::<_, HashSet<String>>(key).await
            })
            .await
        {
            members.extend(remote);
        }
        members
    }

    // -- Sorted sets --

    /// Add `members` at `score` and drop every member scored below `floor`,
    /// as one operation.
    pub async fn scored_add(&self, key: &str, members: &[String], score: i64, floor: i64) {
        let done = self
            .with_remote("zadd", |mut c| async move {
                let items: Vec<(i64, &str)> = members.iter().map(|m| (score, m.as_str())).collect();
                let mut pipe = redis::pipe();
                pipe.atomic();
                if !items.is_empty() {
                    pipe.zadd_multiple(key, &items).ignore();
                }
                pipe.zrembyscore(key, "-inf", format!("({}", floor)).ignore();
                let _: () = pipe.query_async(&mut c).await?;
                Ok::<_, redis::RedisError>(())
            })
            .await;
        if done.is_none() {
            self.inner.local.scored_add(key, members, score, floor);
        }
    }

    /// Members scored at or above `floor`.
    pub async fn scored_from(&self, key: &str, floor: i64) -> HashSet<String> {
        let mut members = self.inner.local.scored_from(key, floor);
        if let Some(remote) = self
            .with_remote("zrangebyscore", |mut c| async move {
                c.zrangebyscore::<_, _, _, HashSet<String>>(key, floor, "+inf").await
            })
            .await
        {
            members.extend(remote);
        }
        members
    }

    // -- Strings / TTL --

    /// INCR with a TTL that starts when the counter is created. Creation and
    /// increment run as one atomic pipeline, so a counter never lives without
    /// its TTL.
    pub async fn string_incr_with_expiry(&self, key: &str, ttl: Duration) -> i64 {
        let remote = self
            .with_remote("incr", |mut c| async move {
                let (count,): (i64,) = redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(key)
                    .arg(0)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .ignore()
                    .incr(key, 1)
                    .query_async(&mut c)
                    .await?;
                Ok::<_, redis::RedisError>(count)
            })
            .await;
        match remote {
            Some(count) => count,
            None => self.inner.local.incr_with_expiry(key, ttl),
        }
    }

    /// Drop expired keys held in local memory. Remote keys expire on their own.
    pub fn sweep_local(&self) -> usize {
        self.inner.local.sweep()
    }

    // -- Pub/sub --

    /// Publish `payload` on `topic`. With a remote backend every instance
    /// (including this one) receives it through [`Self::subscribe`].
    pub async fn publish(&self, topic: &str, payload: &str) {
        let done = self
            .with_remote("publish", |mut c| async move {
                c.publish::<_, _, ()>(topic, payload).await
            })
            .await;
        if done.is_none() {
            let _ = self
                .inner
                .local_bus
                .send((topic.to_string(), payload.to_string()));
        }
    }

    /// Subscribe to `topic`. Payloads arrive on the returned receiver until the
    /// store is dropped or the remote subscription ends.
    pub async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Local publishes are always forwarded: they are what a degraded
        // remote falls back to.
        let mut local_rx = self.inner.local_bus.subscribe();
        let local_topic = topic.to_string();
        let local_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match local_rx.recv().await {
                    Ok((topic, payload)) => {
                        if topic == local_topic && local_tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Local bus subscriber lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(remote) = &self.inner.remote {
            match remote.client.get_async_pubsub().await {
                Ok(mut pubsub) => match pubsub.subscribe(topic).await {
                    Ok(()) => {
                        let remote_topic = topic.to_string();
                        tokio::spawn(async move {
                            let mut messages = pubsub.on_message();
                            while let Some(msg) = messages.next().await {
                                match msg.get_payload::<String>() {
                                    Ok(payload) => {
                                        if tx.send(payload).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!("Undecodable pub/sub payload: {}", e),
                                }
                            }
                            debug!("Remote subscription to {} ended", remote_topic);
                        });
                    }
                    Err(e) => warn!("Could not subscribe to {}: {}", topic, e),
                },
                Err(e) => warn!("Could not open pub/sub connection: {}", e),
            }
        }

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_serves_all_primitives() {
        let store = SharedStateStore::memory();
        assert!(!store.is_remote());

        store.hash_set("h", "f", "v").await;
        assert_eq!(store.hash_get("h", "f").await.as_deref(), Some("v"));
        assert_eq!(store.hash_get_all("h").await.len(), 1);
        store.hash_del("h", "f").await;
        assert_eq!(store.hash_get("h", "f").await, None);

        store.set_add("s", "m").await;
        assert!(store.set_is_member("s", "m").await);
        store.set_remove("s", "m").await;
        assert!(store.set_members("s").await.is_empty());

        store.scored_add("z", &["old".to_string()], 10, 0).await;
        store.scored_add("z", &["new".to_string()], 50, 20).await;
        assert_eq!(store.scored_from("z", 0).await, HashSet::from(["new".to_string()]));
    }

    #[tokio::test]
    #[ignore] // needs Redis: LOUNGE_TEST_REDIS_URL, default redis://127.0.0.1/
    async fn remote_counter_is_created_with_its_ttl() {
        let url = std::env::var("LOUNGE_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let store = SharedStateStore::try_connect(&url).await.unwrap();
        let key = format!("irc_limit:test-{}", unique_suffix());

        let window = Duration::from_secs(60);
        assert_eq!(store.string_incr_with_expiry(&key, window).await, 1);
        assert_eq!(store.string_incr_with_expiry(&key, window).await, 2);

        let mut conn = store.inner.remote.as_ref().unwrap().conn.clone();
        let ttl: i64 = conn.ttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60, "unexpected ttl {}", ttl);
        let _: () = conn.del(&key).await.unwrap();
    }

    fn unique_suffix() -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{}-{}", std::process::id(), nanos)
    }

    #[tokio::test]
    async fn local_bus_delivers_by_topic() {
        let store = SharedStateStore::memory();
        let mut rx = store.subscribe("room_events").await;

        store.publish("other", "ignored").await;
        store.publish("room_events", "hello").await;

        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }
}
