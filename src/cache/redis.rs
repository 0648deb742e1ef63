use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::app::Result;
use crate::cache::{Cache, CacheValue, RemainingTtl};

/// Namespace prefix so `clear` can truncate this cache without touching
/// unrelated keys in a shared database.
const KEY_PREFIX: &str = "estuary:";

/// Remote key-value backend over redis.
///
/// Entries are stored as hashes (`t` = value type, `d` = payload) so the
/// discriminator and payload live and expire together. Expiry is native
/// (`PEXPIRE`), so there is no background sweep to run; increment uses
/// `HINCRBY`, the one backend primitive here that is atomic across
/// processes.
pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
    default_ttl: Option<Duration>,
}

impl RedisCache {
    pub async fn connect(url: &str, default_ttl: Option<Duration>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn, default_ttl })
    }

    fn full_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    async fn apply_default_ttl(&self, full_key: &str) -> Result<()> {
        if let Some(ttl) = self.default_ttl {
            let mut conn = self.conn.clone();
            let pttl: i64 = redis::cmd("PTTL").arg(full_key).query_async(&mut conn).await?;
            if pttl == -1 {
                let _: bool = conn.pexpire(full_key, ttl.as_millis() as i64).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let mut conn = self.conn.clone();
        let (value_type, payload): (Option<String>, Option<Vec<u8>>) = redis::cmd("HMGET")
            .arg(Self::full_key(key))
            .arg("t")
            .arg("d")
            .query_async(&mut conn)
            .await?;

        match (value_type, payload) {
            (Some(t), Some(d)) => Ok(Some(CacheValue::decode(&t, d))),
            // A counter created by HINCRBY has no explicit discriminator.
            (None, Some(d)) => Ok(Some(CacheValue::decode("text", d))),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()> {
        let (payload, value_type) = value.encode();
        let full_key = Self::full_key(key);
        let effective = match ttl {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => self.default_ttl,
        };

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&full_key)
            .ignore()
            .hset(&full_key, "t", value_type)
            .ignore()
            .hset(&full_key, "d", payload)
            .ignore();
        if let Some(d) = effective {
            pipe.cmd("PEXPIRE")
                .arg(&full_key)
                .arg(d.as_millis() as i64)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(Self::full_key(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(Self::full_key(key)).await?)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", KEY_PREFIX);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let _: i64 = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        let full_key = Self::full_key(key);
        let mut conn = self.conn.clone();
        let next: i64 = conn.hincr(&full_key, "d", amount).await?;
        let _: bool = conn.hset(&full_key, "t", "text").await?;
        self.apply_default_ttl(&full_key).await?;
        Ok(next)
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<RemainingTtl>> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(Self::full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(match pttl {
            -2 => None,
            -1 => Some(None),
            ms => Some(Some(Duration::from_millis(ms.max(0) as u64))),
        })
    }

    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let full_key = Self::full_key(key);
        let mut conn = self.conn.clone();
        match ttl {
            Some(d) => Ok(conn.pexpire(&full_key, d.as_millis() as i64).await?),
            None => {
                let existed: bool = conn.exists(&full_key).await?;
                if existed {
                    let _: bool = conn.persist(&full_key).await?;
                }
                Ok(existed)
            }
        }
    }

    // Expiry is native; nothing to sweep.
}
