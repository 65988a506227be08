//! MongoDB-backed adapters.
//!
//! Every op that needs to be atomic is a single `find_one_and_update`/
//! `find_one_and_delete` call — Mongo guarantees those are atomic per
//! document, which is exactly the granularity every `ks_storage`
//! contract method asks for. "Insert if absent or expired" (lock
//! `acquire`, cache `add`) is expressed as an upsert whose filter only
//! matches a vacant or expired document; when a live document already
//! holds the `_id`, the upsert's implicit insert collides on `_id` and
//! Mongo reports a duplicate-key error, which this module treats as the
//! ordinary "already held" `false` result rather than an adapter error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, DateTime as BsonDateTime};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use ks_domain::{Error, Result};
use ks_storage::{
    CacheAdapter, CacheRecord, LockAdapter, LockRecord, RateLimiterRecord, RateLimiterStorageAdapter,
    RateLimiterTransition,
};

fn wrap(err: mongodb::error::Error) -> Error {
    Error::Adapter(anyhow::Error::from(err))
}

/// `true` iff `err` is a duplicate-key write error (Mongo code 11000) —
/// the signal that an "insert if absent" upsert lost a race to a live
/// document already holding that `_id`.
fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}

fn to_bson(at: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_chrono(at)
}

fn from_bson(at: BsonDateTime) -> DateTime<Utc> {
    at.to_chrono()
}

fn to_chrono_duration(ttl: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(ttl.as_millis() as i64)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, Deserialize)]
struct LockDoc {
    #[serde(rename = "_id")]
    id: String,
    lock_id: String,
    expires_at: Option<BsonDateTime>,
}

pub struct MongoLockAdapter {
    collection: Collection<LockDoc>,
}

impl MongoLockAdapter {
    pub fn new(db: &Database, collection_name: &str) -> Self {
        Self {
            collection: db.collection(collection_name),
        }
    }
}

#[async_trait]
impl LockAdapter for MongoLockAdapter {
    async fn acquire(&self, key: &str, lock_id: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let filter = doc! {
            "_id": key,
            "$or": [
                { "expires_at": null },
                { "expires_at": { "$lte": to_bson(now) } },
            ],
        };
        let update = doc! {
            "$set": {
                "lock_id": lock_id,
                "expires_at": ttl.map(|d| to_bson(now + to_chrono_duration(d))),
            },
        };
        let options = FindOneAndUpdateOptions::builder().upsert(true).build();
        match self.collection.find_one_and_update(filter, update, options).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(err) => Err(wrap(err)),
        }
    }

    async fn release(&self, key: &str, lock_id: &str) -> Result<bool> {
        let filter = doc! { "_id": key, "lock_id": lock_id };
        let deleted = self.collection.find_one_and_delete(filter, None).await.map_err(wrap)?;
        Ok(deleted.is_some())
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let result = self
            .collection
            .delete_one(doc! { "_id": key }, None)
            .await
            .map_err(wrap)?;
        Ok(result.deleted_count > 0)
    }

    async fn refresh(&self, key: &str, lock_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let filter = doc! {
            "_id": key,
            "lock_id": lock_id,
            "expires_at": { "$ne": null, "$gt": to_bson(now) },
        };
        let update = doc! { "$set": { "expires_at": to_bson(now + to_chrono_duration(ttl)) } };
        let updated = self
            .collection
            .find_one_and_update(filter, update, None)
            .await
            .map_err(wrap)?;
        Ok(updated.is_some())
    }

    async fn get_state(&self, key: &str) -> Result<Option<LockRecord>> {
        let now = Utc::now();
        let filter = doc! {
            "_id": key,
            "$or": [
                { "expires_at": null },
                { "expires_at": { "$gt": to_bson(now) } },
            ],
        };
        let found = self.collection.find_one(filter, None).await.map_err(wrap)?;
        Ok(found.map(|doc| LockRecord {
            lock_id: doc.lock_id,
            expires_at: doc.expires_at.map(from_bson),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, Deserialize)]
struct LimiterDoc {
    #[serde(rename = "_id")]
    id: String,
    state: serde_json::Value,
    expires_at: BsonDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct TxLockDoc {
    #[serde(rename = "_id")]
    id: String,
    token: String,
    expires_at: BsonDateTime,
}

const TRANSACT_LOCK_RETRIES: u32 = 100;
const TRANSACT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);
const TRANSACT_LOCK_TTL: Duration = Duration::from_secs(2);

pub struct MongoRateLimiterAdapter {
    collection: Collection<LimiterDoc>,
    tx_locks: Collection<TxLockDoc>,
}

impl MongoRateLimiterAdapter {
    pub fn new(db: &Database, collection_name: &str) -> Self {
        Self {
            collection: db.collection(collection_name),
            tx_locks: db.collection(&format!("{collection_name}_txlocks")),
        }
    }

    async fn acquire_tx_lock(&self, key: &str) -> Result<String> {
        let token = format!("{:x}", rand::random::<u64>());
        let mut attempts = 0;
        loop {
            let now = Utc::now();
            let filter = doc! { "_id": key, "expires_at": { "$lte": to_bson(now) } };
            let update = doc! {
                "$set": { "token": &token, "expires_at": to_bson(now + to_chrono_duration(TRANSACT_LOCK_TTL)) },
            };
            let options = FindOneAndUpdateOptions::builder().upsert(true).build();
            match self.tx_locks.find_one_and_update(filter, update, options).await {
                Ok(_) => return Ok(token),
                Err(err) if is_duplicate_key(&err) => {}
                Err(err) => return Err(wrap(err)),
            }
            attempts += 1;
            if attempts > TRANSACT_LOCK_RETRIES {
                return Err(Error::Other(format!(
                    "timed out acquiring rate-limiter transaction lock for {key}"
                )));
            }
            tokio::time::sleep(TRANSACT_LOCK_RETRY_DELAY).await;
        }
    }

    async fn release_tx_lock(&self, key: &str, token: &str) {
        let _ = self
            .tx_locks
            .delete_one(doc! { "_id": key, "token": token }, None)
            .await;
    }
}

#[async_trait]
impl RateLimiterStorageAdapter for MongoRateLimiterAdapter {
    async fn find(&self, key: &str) -> Result<Option<RateLimiterRecord>> {
        let now = Utc::now();
        let filter = doc! { "_id": key, "expires_at": { "$gt": to_bson(now) } };
        let found = self.collection.find_one(filter, None).await.map_err(wrap)?;
        Ok(found.map(|doc| RateLimiterRecord {
            state: doc.state,
            expires_at: from_bson(doc.expires_at),
        }))
    }

    async fn transact(&self, key: &str, transition: RateLimiterTransition) -> Result<serde_json::Value> {
        let token = self.acquire_tx_lock(key).await?;

        let now = Utc::now();
        let existing = self
            .collection
            .find_one(doc! { "_id": key, "expires_at": { "$gt": to_bson(now) } }, None)
            .await
            .map_err(wrap);

        let result = match existing {
            Ok(existing) => {
                let current = existing.map(|doc| RateLimiterRecord {
                    state: doc.state,
                    expires_at: from_bson(doc.expires_at),
                });
                let (next, outcome) = transition(current);
                let upsert = self
                    .collection
                    .replace_one(
                        doc! { "_id": key },
                        LimiterDoc {
                            id: key.to_owned(),
                            state: next.state,
                            expires_at: to_bson(next.expires_at),
                        },
                        mongodb::options::ReplaceOptions::builder().upsert(true).build(),
                    )
                    .await
                    .map_err(wrap);
                upsert.map(|_| outcome)
            }
            Err(err) => Err(err),
        };

        self.release_tx_lock(key, &token).await;
        result
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.collection
            .delete_one(doc! { "_id": key }, None)
            .await
            .map_err(wrap)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, Deserialize)]
struct CacheDoc {
    #[serde(rename = "_id")]
    id: String,
    value: serde_json::Value,
    expires_at: Option<BsonDateTime>,
}

fn live_filter(key: &str, now: DateTime<Utc>) -> mongodb::bson::Document {
    doc! {
        "_id": key,
        "$or": [
            { "expires_at": null },
            { "expires_at": { "$gt": to_bson(now) } },
        ],
    }
}

fn to_record(doc: CacheDoc) -> CacheRecord {
    CacheRecord {
        value: doc.value,
        expires_at: doc.expires_at.map(from_bson),
    }
}

pub struct MongoCacheAdapter {
    collection: Collection<CacheDoc>,
}

impl MongoCacheAdapter {
    pub fn new(db: &Database, collection_name: &str) -> Self {
        Self {
            collection: db.collection(collection_name),
        }
    }
}

#[async_trait]
impl CacheAdapter for MongoCacheAdapter {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let found = self
            .collection
            .find_one(live_filter(key, Utc::now()), None)
            .await
            .map_err(wrap)?;
        Ok(found.map(to_record))
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<CacheRecord>> {
        let found = self
            .collection
            .find_one_and_delete(live_filter(key, Utc::now()), None)
            .await
            .map_err(wrap)?;
        Ok(found.map(to_record))
    }

    async fn add(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let filter = doc! {
            "_id": key,
            "$or": [
                { "expires_at": null },
                { "expires_at": { "$lte": to_bson(now) } },
            ],
        };
        let update = doc! {
            "$set": {
                "value": mongodb::bson::to_bson(&value).map_err(|e| Error::Adapter(anyhow::Error::from(e)))?,
                "expires_at": ttl.map(|d| to_bson(now + to_chrono_duration(d))),
            },
        };
        let options = FindOneAndUpdateOptions::builder().upsert(true).build();
        match self.collection.find_one_and_update(filter, update, options).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(err) => Err(wrap(err)),
        }
    }

    async fn update(&self, key: &str, value: serde_json::Value) -> Result<bool> {
        let update = doc! {
            "$set": {
                "value": mongodb::bson::to_bson(&value).map_err(|e| Error::Adapter(anyhow::Error::from(e)))?,
            },
        };
        let updated = self
            .collection
            .find_one_and_update(live_filter(key, Utc::now()), update, None)
            .await
            .map_err(wrap)?;
        Ok(updated.is_some())
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let doc = CacheDoc {
            id: key.to_owned(),
            value,
            expires_at: ttl.map(|d| to_bson(now + to_chrono_duration(d))),
        };
        let previous = self
            .collection
            .find_one_and_replace(
                doc! { "_id": key },
                &doc,
                mongodb::options::FindOneAndReplaceOptions::builder()
                    .upsert(true)
                    .return_document(ReturnDocument::Before)
                    .build(),
            )
            .await
            .map_err(wrap)?;
        Ok(previous
            .map(|prev| prev.expires_at.map(from_bson).map(|at| at > now).unwrap_or(true))
            .unwrap_or(false))
    }

    async fn increment(&self, key: &str, delta: f64) -> Result<Option<f64>> {
        let filter = live_filter(key, Utc::now());
        let update = doc! { "$inc": { "value": delta } };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        match self.collection.find_one_and_update(filter, update, options).await {
            Ok(Some(doc)) => doc
                .value
                .as_f64()
                .map(Some)
                .ok_or_else(|| Error::TypeCache { key: key.to_owned() }),
            Ok(None) => Ok(None),
            Err(err) => match err.kind.as_ref() {
                ErrorKind::Command(command_error) if command_error.code == 14 => {
                    Err(Error::TypeCache { key: key.to_owned() })
                }
                _ => Err(wrap(err)),
            },
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let result = self
            .collection
            .delete_one(doc! { "_id": key }, None)
            .await
            .map_err(wrap)?;
        Ok(result.deleted_count > 0)
    }

    async fn remove_many(&self, keys: &[String]) -> Result<bool> {
        if keys.is_empty() {
            return Ok(false);
        }
        let result = self
            .collection
            .delete_many(doc! { "_id": { "$in": keys } }, None)
            .await
            .map_err(wrap)?;
        Ok(result.deleted_count > 0)
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let pattern = format!("^{}", regex_escape(prefix));
        self.collection
            .delete_many(doc! { "_id": { "$regex": pattern } }, None)
            .await
            .map_err(wrap)?;
        Ok(())
    }
}

/// Minimal regex-metacharacter escape for prefix matching; namespace
/// prefixes only ever contain delimiter characters (`:`, `/`) alongside
/// alphanumerics, but this guards against a caller-chosen delimiter that
/// happens to be a regex metacharacter.
fn regex_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        if "\\.+*?()|[]{}^$".contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_escape_handles_metacharacters() {
        assert_eq!(regex_escape("cache:user:"), "cache:user:");
        assert_eq!(regex_escape("a.b+c"), "a\\.b\\+c");
    }

    async fn test_database() -> Option<Database> {
        let uri = std::env::var("MONGODB_URL").unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_owned());
        let client = mongodb::Client::with_uri_str(uri).await.ok()?;
        Some(client.database("ks_storage_mongodb_test"))
    }

    #[tokio::test]
    #[ignore = "requires a live MongoDB instance at MONGODB_URL"]
    async fn lock_acquire_excludes_other_owners() {
        let Some(db) = test_database().await else { return };
        let adapter = MongoLockAdapter::new(&db, "ks_test_locks");
        let key = "ks-storage-mongodb-test:lock:excludes";
        adapter.force_release(key).await.unwrap();
        assert!(adapter.acquire(key, "a", None).await.unwrap());
        assert!(!adapter.acquire(key, "b", None).await.unwrap());
        assert!(adapter.release(key, "a").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a live MongoDB instance at MONGODB_URL"]
    async fn cache_add_is_insert_if_absent() {
        let Some(db) = test_database().await else { return };
        let adapter = MongoCacheAdapter::new(&db, "ks_test_cache");
        let key = "ks-storage-mongodb-test:cache:add";
        adapter.remove(key).await.unwrap();
        assert!(adapter.add(key, serde_json::json!(1), None).await.unwrap());
        assert!(!adapter.add(key, serde_json::json!(2), None).await.unwrap());
        adapter.remove(key).await.unwrap();
    }
}
