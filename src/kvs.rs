//! KVS gateway: the capability set the scheduler core uses to talk to the
//! shared store.
//!
//! Two wirings exist behind the [`Kvs`] trait: a single-endpoint client and
//! a sharded (cluster) client, selected once at startup. Scheduling logic
//! never sees which one is in use. An in-process [`MemoryKvs`] backend backs
//! the test suites.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::FromRedisValue;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::config::split_kvs_addr;
use crate::types::SchedulerResult;

/// Set of uuids pending a worker claim.
pub const REQUEST_UUID_SET: &str = "request_uuid_set";

/// Set of uuids whose latest attempt failed and await a retry decision.
pub const FAIL_RESULT_UUID_SET: &str = "fail_result_uuid_set";

/// Store capabilities required by the scheduler core.
///
/// All keys are flat strings; hash values are string-to-string. Linearizable
/// per-key semantics are assumed for `set_pop_one` and `counter_incr`.
#[async_trait]
pub trait Kvs: Send + Sync {
    /// Write (or overwrite) fields of a hash.
    async fn hash_set_fields(&self, key: &str, fields: &[(&str, String)]) -> SchedulerResult<()>;

    /// Read the named fields of a hash. Absent fields (or an absent hash)
    /// read as `None`, positionally.
    async fn hash_get_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> SchedulerResult<Vec<Option<String>>>;

    /// Delete a key.
    async fn hash_delete(&self, key: &str) -> SchedulerResult<()>;

    /// Add a member to a set.
    async fn set_add(&self, set: &str, member: &str) -> SchedulerResult<()>;

    /// Atomically pop one arbitrary member; `None` when the set is empty.
    async fn set_pop_one(&self, set: &str) -> SchedulerResult<Option<String>>;

    /// Number of members in a set.
    async fn set_cardinality(&self, set: &str) -> SchedulerResult<i64>;

    /// Increment a counter key, returning the new value.
    async fn counter_incr(&self, key: &str) -> SchedulerResult<i64>;

    /// Read a counter key; absent keys read as 0.
    async fn counter_get(&self, key: &str) -> SchedulerResult<i64>;

    /// Apply a TTL in seconds to a key.
    async fn set_ttl(&self, key: &str, seconds: u64) -> SchedulerResult<()>;

    /// Liveness check.
    async fn ping(&self) -> SchedulerResult<()>;
}

enum RedisConn {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Redis-backed gateway.
pub struct RedisKvs {
    conn: RedisConn,
}

impl RedisKvs {
    /// Connect using the wiring selected at startup, then verify with PING.
    pub async fn connect(addr: &str, cluster: bool) -> SchedulerResult<Self> {
        let kvs = if cluster {
            Self::connect_cluster(addr).await?
        } else {
            Self::connect_single(addr).await?
        };
        kvs.ping().await?;
        Ok(kvs)
    }

    /// Single-endpoint wiring; honors a `/DB` suffix on the address.
    pub async fn connect_single(addr: &str) -> SchedulerResult<Self> {
        let (host, db) = split_kvs_addr(addr)?;
        let client = redis::Client::open(format!("redis://{host}/{db}"))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn: RedisConn::Single(conn),
        })
    }

    /// Sharded wiring. Cluster mode has no database selection, so any
    /// `/DB` suffix is ignored.
    pub async fn connect_cluster(addr: &str) -> SchedulerResult<Self> {
        let (host, _) = split_kvs_addr(addr)?;
        let client = ClusterClient::new(vec![format!("redis://{host}")])?;
        let conn = client.get_async_connection().await?;
        Ok(Self {
            conn: RedisConn::Cluster(conn),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> SchedulerResult<T> {
        match &self.conn {
            RedisConn::Single(conn) => {
                let mut conn = conn.clone();
                Ok(cmd.query_async(&mut conn).await?)
            }
            RedisConn::Cluster(conn) => {
                let mut conn = conn.clone();
                Ok(cmd.query_async(&mut conn).await?)
            }
        }
    }
}

#[async_trait]
impl Kvs for RedisKvs {
    async fn hash_set_fields(&self, key: &str, fields: &[(&str, String)]) -> SchedulerResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        self.query::<()>(&cmd).await
    }

    async fn hash_get_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> SchedulerResult<Vec<Option<String>>> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }
        self.query(&cmd).await
    }

    async fn hash_delete(&self, key: &str) -> SchedulerResult<()> {
        self.query::<()>(redis::cmd("DEL").arg(key)).await
    }

    async fn set_add(&self, set: &str, member: &str) -> SchedulerResult<()> {
        self.query::<()>(redis::cmd("SADD").arg(set).arg(member))
            .await
    }

    async fn set_pop_one(&self, set: &str) -> SchedulerResult<Option<String>> {
        self.query(redis::cmd("SPOP").arg(set)).await
    }

    async fn set_cardinality(&self, set: &str) -> SchedulerResult<i64> {
        self.query(redis::cmd("SCARD").arg(set)).await
    }

    async fn counter_incr(&self, key: &str) -> SchedulerResult<i64> {
        self.query(redis::cmd("INCR").arg(key)).await
    }

    async fn counter_get(&self, key: &str) -> SchedulerResult<i64> {
        let value: Option<i64> = self.query(redis::cmd("GET").arg(key)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn set_ttl(&self, key: &str, seconds: u64) -> SchedulerResult<()> {
        self.query::<()>(redis::cmd("EXPIRE").arg(key).arg(seconds as i64))
            .await
    }

    async fn ping(&self) -> SchedulerResult<()> {
        self.query::<String>(&redis::cmd("PING")).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    counters: HashMap<String, i64>,
    ttls: HashMap<String, u64>,
}

/// In-process backend used by the test suites.
///
/// Implements the full capability set over plain maps. TTLs are recorded for
/// inspection but not enforced; expiry-dependent behavior is exercised by
/// deleting keys explicitly.
#[derive(Default)]
pub struct MemoryKvs {
    state: Mutex<MemoryState>,
}

impl MemoryKvs {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL recorded for a key, if any.
    pub async fn ttl_of(&self, key: &str) -> Option<u64> {
        self.state.lock().await.ttls.get(key).copied()
    }
}

#[async_trait]
impl Kvs for MemoryKvs {
    async fn hash_set_fields(&self, key: &str, fields: &[(&str, String)]) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> SchedulerResult<Vec<Option<String>>> {
        let state = self.state.lock().await;
        let hash = state.hashes.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(*field).cloned()))
            .collect())
    }

    async fn hash_delete(&self, key: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        state.hashes.remove(key);
        state.counters.remove(key);
        state.ttls.remove(key);
        Ok(())
    }

    async fn set_add(&self, set: &str, member: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        state
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_pop_one(&self, set: &str) -> SchedulerResult<Option<String>> {
        let mut state = self.state.lock().await;
        let Some(members) = state.sets.get_mut(set) else {
            return Ok(None);
        };
        let member = members.iter().next().cloned();
        if let Some(member) = &member {
            members.remove(member);
        }
        Ok(member)
    }

    async fn set_cardinality(&self, set: &str) -> SchedulerResult<i64> {
        let state = self.state.lock().await;
        Ok(state.sets.get(set).map_or(0, |m| m.len() as i64))
    }

    async fn counter_incr(&self, key: &str) -> SchedulerResult<i64> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn counter_get(&self, key: &str) -> SchedulerResult<i64> {
        let state = self.state.lock().await;
        Ok(state.counters.get(key).copied().unwrap_or(0))
    }

    async fn set_ttl(&self, key: &str, seconds: u64) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        state.ttls.insert(key.to_string(), seconds);
        Ok(())
    }

    async fn ping(&self) -> SchedulerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_hash_round_trip() {
        let kvs = MemoryKvs::new();
        kvs.hash_set_fields("t_1", &[("uuid", "1".into()), ("args", "a b".into())])
            .await
            .unwrap();

        let values = kvs
            .hash_get_fields("t_1", &["uuid", "args", "missing"])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_string()), Some("a b".to_string()), None]
        );

        kvs.hash_delete("t_1").await.unwrap();
        let values = kvs.hash_get_fields("t_1", &["uuid"]).await.unwrap();
        assert_eq!(values, vec![None]);
    }

    #[tokio::test]
    async fn memory_set_pop_and_cardinality() {
        let kvs = MemoryKvs::new();
        assert_eq!(kvs.set_pop_one(REQUEST_UUID_SET).await.unwrap(), None);

        kvs.set_add(REQUEST_UUID_SET, "a").await.unwrap();
        kvs.set_add(REQUEST_UUID_SET, "a").await.unwrap();
        assert_eq!(kvs.set_cardinality(REQUEST_UUID_SET).await.unwrap(), 1);

        assert_eq!(
            kvs.set_pop_one(REQUEST_UUID_SET).await.unwrap(),
            Some("a".to_string())
        );
        assert_eq!(kvs.set_cardinality(REQUEST_UUID_SET).await.unwrap(), 0);
        assert_eq!(kvs.set_pop_one(REQUEST_UUID_SET).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_counters() {
        let kvs = MemoryKvs::new();
        assert_eq!(kvs.counter_get("c").await.unwrap(), 0);
        assert_eq!(kvs.counter_incr("c").await.unwrap(), 1);
        assert_eq!(kvs.counter_incr("c").await.unwrap(), 2);
        assert_eq!(kvs.counter_get("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn memory_records_ttls() {
        let kvs = MemoryKvs::new();
        kvs.set_ttl("r_1", 3600).await.unwrap();
        assert_eq!(kvs.ttl_of("r_1").await, Some(3600));
        assert_eq!(kvs.ttl_of("r_2").await, None);
    }
}
