//! Redis-backed adapters.
//!
//! Lock and cache operations map onto Redis's native atomic commands
//! directly (`SET ... NX`, Lua for compare-and-swap). The rate-limiter
//! engine hands us a `FnOnce` transition closure rather than a
//! server-side expressible script, so its `transact` serializes
//! concurrent callers on the same key behind a short-lived Redis mutex
//! instead of a `WATCH`/`MULTI` retry loop (a retry would need to call
//! `transition` more than once, which `FnOnce` rules out).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::atomic::{AtomicU64, Ordering};

use ks_domain::{Error, Result};
use ks_events::{EventBus, ListenerFn, ListenerId, Payload};
use ks_storage::{
    CacheAdapter, CacheRecord, LockAdapter, LockRecord, RateLimiterRecord, RateLimiterStorageAdapter,
    RateLimiterTransition,
};

fn wrap(err: redis::RedisError) -> Error {
    Error::Adapter(anyhow::Error::from(err))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

static RELEASE_IF_OWNER: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

static REFRESH_IF_OWNER_AND_EXPIRING: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] and redis.call('pttl', KEYS[1]) > 0 then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLockAdapter {
    conn: ConnectionManager,
}

impl RedisLockAdapter {
    pub async fn connect(client: redis::Client) -> Result<Self> {
        let conn = ConnectionManager::new(client).await.map_err(wrap)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LockAdapter for RedisLockAdapter {
    async fn acquire(&self, key: &str, lock_id: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(lock_id).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as i64);
        }
        let result: Option<String> = cmd.query_async(&mut conn).await.map_err(wrap)?;
        Ok(result.is_some())
    }

    async fn release(&self, key: &str, lock_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = Script::new(RELEASE_IF_OWNER)
            .key(key)
            .arg(lock_id)
            .invoke_async(&mut conn)
            .await
            .map_err(wrap)?;
        Ok(result == 1)
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await.map_err(wrap)?;
        Ok(removed > 0)
    }

    async fn refresh(&self, key: &str, lock_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = Script::new(REFRESH_IF_OWNER_AND_EXPIRING)
            .key(key)
            .arg(lock_id)
            .arg(ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(wrap)?;
        Ok(result == 1)
    }

    async fn get_state(&self, key: &str) -> Result<Option<LockRecord>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(wrap)?;
        let Some(lock_id) = value else { return Ok(None) };
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await.map_err(wrap)?;
        let expires_at = (pttl > 0).then(|| Utc::now() + chrono::Duration::milliseconds(pttl));
        Ok(Some(LockRecord { lock_id, expires_at }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How long a `transact` call will keep retrying to acquire the
/// per-key transaction mutex before giving up.
const TRANSACT_LOCK_RETRIES: u32 = 100;
const TRANSACT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);
const TRANSACT_LOCK_TTL_MS: i64 = 2_000;

pub struct RedisRateLimiterAdapter {
    conn: ConnectionManager,
}

impl RedisRateLimiterAdapter {
    pub async fn connect(client: redis::Client) -> Result<Self> {
        let conn = ConnectionManager::new(client).await.map_err(wrap)?;
        Ok(Self { conn })
    }

    async fn run_transition(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        transition: RateLimiterTransition,
    ) -> Result<serde_json::Value> {
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(conn).await.map_err(wrap)?;
        let current = match raw {
            Some(v) => {
                let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(conn).await.map_err(wrap)?;
                if pttl > 0 {
                    Some(RateLimiterRecord {
                        state: serde_json::from_str(&v).map_err(Error::from)?,
                        expires_at: Utc::now() + chrono::Duration::milliseconds(pttl),
                    })
                } else {
                    None
                }
            }
            None => None,
        };

        let (next, outcome) = transition(current);
        let ttl_ms = (next.expires_at - Utc::now()).num_milliseconds().max(1);
        let serialized = serde_json::to_string(&next.state).map_err(Error::from)?;
        redis::cmd("SET")
            .arg(key)
            .arg(&serialized)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, ()>(conn)
            .await
            .map_err(wrap)?;
        Ok(outcome)
    }
}

#[async_trait]
impl RateLimiterStorageAdapter for RedisRateLimiterAdapter {
    async fn find(&self, key: &str) -> Result<Option<RateLimiterRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(wrap)?;
        let Some(raw) = raw else { return Ok(None) };
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await.map_err(wrap)?;
        if pttl <= 0 {
            return Ok(None);
        }
        Ok(Some(RateLimiterRecord {
            state: serde_json::from_str(&raw).map_err(Error::from)?,
            expires_at: Utc::now() + chrono::Duration::milliseconds(pttl),
        }))
    }

    async fn transact(&self, key: &str, transition: RateLimiterTransition) -> Result<serde_json::Value> {
        let mut conn = self.conn.clone();
        let lock_key = format!("{key}:txlock");
        let token = format!("{:x}", rand::random::<u64>());

        let mut attempts = 0;
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(TRANSACT_LOCK_TTL_MS)
                .query_async(&mut conn)
                .await
                .map_err(wrap)?;
            if acquired.is_some() {
                break;
            }
            attempts += 1;
            if attempts > TRANSACT_LOCK_RETRIES {
                return Err(Error::Other(format!(
                    "timed out acquiring rate-limiter transaction lock for {key}"
                )));
            }
            tokio::time::sleep(TRANSACT_LOCK_RETRY_DELAY).await;
        }

        let result = self.run_transition(&mut conn, key, transition).await;

        let _: redis::RedisResult<i64> = Script::new(RELEASE_IF_OWNER)
            .key(&lock_key)
            .arg(&token)
            .invoke_async(&mut conn)
            .await;

        result
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await.map_err(wrap)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

static GET_AND_DELETE: &str = r#"
local v = redis.call('get', KEYS[1])
if v then redis.call('del', KEYS[1]) end
return v
"#;

static PUT_UPSERT: &str = r#"
local existed = redis.call('exists', KEYS[1]) == 1
if ARGV[2] ~= '' then
    redis.call('set', KEYS[1], ARGV[1], 'PX', ARGV[2])
else
    redis.call('set', KEYS[1], ARGV[1])
end
if existed then return 1 else return 0 end
"#;

static INCREMENT_NUMERIC: &str = r#"
local v = redis.call('get', KEYS[1])
if not v then return false end
local n = tonumber(v)
if not n then return 'ERR_TYPE' end
local updated = n + tonumber(ARGV[1])
redis.call('set', KEYS[1], tostring(updated), 'KEEPTTL')
return tostring(updated)
"#;

/// This adapter delegates TTL enforcement entirely to Redis's native
/// expiry. [`CacheRecord::expires_at`] is always `None` here — a `Some`
/// result from the server already means the key is live, so the
/// caller's `is_expired` check never needs to recompute it.
pub struct RedisCacheAdapter {
    conn: ConnectionManager,
}

impl RedisCacheAdapter {
    pub async fn connect(client: redis::Client) -> Result<Self> {
        let conn = ConnectionManager::new(client).await.map_err(wrap)?;
        Ok(Self { conn })
    }

    fn decode(raw: Option<String>) -> Result<Option<CacheRecord>> {
        raw.map(|v| {
            serde_json::from_str(&v)
                .map(|value| CacheRecord { value, expires_at: None })
                .map_err(Error::from)
        })
        .transpose()
    }
}

#[async_trait]
impl CacheAdapter for RedisCacheAdapter {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(wrap)?;
        Self::decode(raw)
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<CacheRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = Script::new(GET_AND_DELETE)
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(wrap)?;
        Self::decode(raw)
    }

    async fn add(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(&value).map_err(Error::from)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(&serialized).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as i64);
        }
        let result: Option<String> = cmd.query_async(&mut conn).await.map_err(wrap)?;
        Ok(result.is_some())
    }

    async fn update(&self, key: &str, value: serde_json::Value) -> Result<bool> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(&value).map_err(Error::from)?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&serialized)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .map_err(wrap)?;
        Ok(result.is_some())
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(&value).map_err(Error::from)?;
        let ttl_arg = ttl.map(|t| t.as_millis().to_string()).unwrap_or_default();
        let result: i64 = Script::new(PUT_UPSERT)
            .key(key)
            .arg(&serialized)
            .arg(ttl_arg)
            .invoke_async(&mut conn)
            .await
            .map_err(wrap)?;
        Ok(result == 1)
    }

    async fn increment(&self, key: &str, delta: f64) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let result: redis::Value = Script::new(INCREMENT_NUMERIC)
            .key(key)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(wrap)?;
        match result {
            redis::Value::Nil => Ok(None),
            redis::Value::Data(bytes) if bytes == b"ERR_TYPE" => Err(Error::TypeCache { key: key.to_owned() }),
            redis::Value::Data(bytes) => String::from_utf8_lossy(&bytes)
                .parse::<f64>()
                .map(Some)
                .map_err(|_| Error::TypeCache { key: key.to_owned() }),
            _ => Err(Error::Other("unexpected redis reply for increment".to_owned())),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await.map_err(wrap)?;
        Ok(removed > 0)
    }

    async fn remove_many(&self, keys: &[String]) -> Result<bool> {
        if keys.is_empty() {
            return Ok(false);
        }
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await.map_err(wrap)?;
        Ok(removed > 0)
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(wrap)?;
            if !keys.is_empty() {
                redis::cmd("DEL").arg(&keys).query_async::<_, ()>(&mut conn).await.map_err(wrap)?;
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cross-process event bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type TopicMap = Arc<RwLock<std::collections::HashMap<String, Vec<(ListenerId, ListenerFn)>>>>;

/// Cross-process `EventBus` over Redis pub/sub. At-most-once, no
/// replay: a listener only sees events dispatched after it subscribes,
/// same as [`ks_events::InProcessEventBus`], but now shared across every
/// process pointed at the same Redis instance.
///
/// Delivery always round-trips through Redis, even within this
/// process — `dispatch` only publishes; listeners are invoked by the
/// background task that received our own `PSUBSCRIBE *` stream. This
/// keeps local and remote delivery on one code path instead of special
///-casing same-process listeners.
pub struct RedisEventBus {
    topics: TopicMap,
    next_id: AtomicU64,
    publish_conn: ConnectionManager,
}

impl RedisEventBus {
    pub async fn connect(client: redis::Client) -> Result<Self> {
        let publish_conn = ConnectionManager::new(client.clone()).await.map_err(wrap)?;
        let topics: TopicMap = Arc::new(RwLock::new(std::collections::HashMap::new()));

        let pubsub_conn = client.get_async_connection().await.map_err(wrap)?;
        let mut pubsub = pubsub_conn.into_pubsub();
        pubsub.psubscribe("*").await.map_err(wrap)?;

        let dispatch_topics = topics.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel: String = msg.get_channel_name().to_owned();
                let payload: Payload = match msg.get_payload::<String>() {
                    Ok(raw) => serde_json::from_str(&raw).unwrap_or(Payload::Null),
                    Err(err) => {
                        tracing::warn!(%err, channel, "redis event payload decode failed");
                        continue;
                    }
                };

                let listeners: Vec<(ListenerId, ListenerFn)> =
                    dispatch_topics.read().get(&channel).cloned().unwrap_or_default();
                for (id, listener) in listeners {
                    let payload = payload.clone();
                    tokio::spawn(async move {
                        if let Err(err) = listener(payload).await {
                            tracing::warn!(?id, error = %err, "redis event listener failed");
                        }
                    });
                }
            }
        });

        Ok(Self {
            topics,
            next_id: AtomicU64::new(1),
            publish_conn,
        })
    }

    fn alloc_id(&self) -> ListenerId {
        ListenerId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn find_duplicate(&self, topic: &str, listener: &ListenerFn) -> Option<ListenerId> {
        self.topics.read().get(topic).and_then(|listeners| {
            listeners
                .iter()
                .find(|(_, existing)| Arc::ptr_eq(existing, listener))
                .map(|(id, _)| *id)
        })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn dispatch(&self, topic: &str, payload: Payload) {
        let mut conn = self.publish_conn.clone();
        let serialized = payload.to_string();
        if let Err(err) = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(serialized)
            .query_async::<_, i64>(&mut conn)
            .await
        {
            tracing::warn!(%err, topic, "redis publish failed");
        }
    }

    fn add_listener(&self, topic: &str, listener: ListenerFn) -> ListenerId {
        if let Some(existing) = self.find_duplicate(topic, &listener) {
            return existing;
        }
        let id = self.alloc_id();
        self.topics.write().entry(topic.to_owned()).or_default().push((id, listener));
        id
    }

    fn remove_listener(&self, topic: &str, id: ListenerId) {
        if let Some(listeners) = self.topics.write().get_mut(topic) {
            listeners.retain(|(existing, _)| *existing != id);
        }
    }

    fn listen_once(&self, topic: &str, listener: ListenerFn) -> ListenerId {
        let id = self.alloc_id();
        let topics = self.topics.clone();
        let topic_owned = topic.to_owned();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let wrapper: ListenerFn = Arc::new(move |payload| {
            let topics = topics.clone();
            let topic = topic_owned.clone();
            let fired = fired.clone();
            let listener = listener.clone();
            Box::pin(async move {
                if fired.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                if let Some(listeners) = topics.write().get_mut(&topic) {
                    listeners.retain(|(existing, _)| *existing != id);
                }
                listener(payload).await
            })
        });

        self.topics.write().entry(topic.to_owned()).or_default().push((id, wrapper));
        id
    }
}

/// Pulls a connection URL from `REDIS_URL`, defaulting to a local
/// instance. Integration tests that need a live server skip themselves
/// when the connection fails rather than failing the whole suite.
#[cfg(test)]
fn test_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned())
}
