//! `KvStore` over a Redis server (cargo feature `redis`).
//!
//! # Invariants
//! - Each trait call maps to exactly one Redis command or script, so the
//!   server's single-threaded execution provides the atomicity.
//! - Compare-and-delete runs as a Lua script, never as GET followed by DEL.
//! - One connection per store; calls are serialized over it, and a
//!   connection that failed at the transport level is never reused.

use super::{check_bitfield_width, KvError, KvResult, KvStore};
use log::error;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use redis::{Client, Commands, Connection, RedisResult, Script};
use std::time::Duration;

static DELETE_IF_EQUALS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
          end
          return 0",
    )
});

/// Redis-backed key-value store.
///
/// Commands share one connection, opened on first use and reopened after
/// a transport failure.
pub struct RedisKvStore {
    client: Client,
    conn: Mutex<Option<Connection>>,
}

impl RedisKvStore {
    /// Creates a client for `url` (for example `redis://127.0.0.1:6379`).
    ///
    /// No connection is made until the first command.
    pub fn open(url: &str) -> KvResult<Self> {
        let client = Client::open(url).map_err(|err| KvError::Malformed(err.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    fn with_connection<T>(
        &self,
        command: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> KvResult<T> {
        let mut slot = self.conn.lock();
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.client.get_connection().map_err(|err| {
                error!(
                    "event=kv_connect module=kv status=error backend=redis error={}",
                    err
                );
                backend(err)
            })?,
        };

        let result = command(&mut conn);
        match &result {
            // A dead socket is dropped; the next call reconnects.
            Err(err) if err.is_io_error() || err.is_connection_dropped() => {}
            _ => *slot = Some(conn),
        }
        result.map_err(backend)
    }
}

fn backend(err: redis::RedisError) -> KvError {
    if err.kind() == redis::ErrorKind::TypeError {
        return KvError::WrongType(err.to_string());
    }
    KvError::Backend(err.to_string())
}

fn bit_offset(offset: u64) -> KvResult<usize> {
    usize::try_from(offset)
        .map_err(|_| KvError::Malformed(format!("bit offset {offset} is out of range")))
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl KvStore for RedisKvStore {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.with_connection(|conn| conn.get(key))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.with_connection(|conn| match ttl {
            Some(ttl) => redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query(conn),
            None => conn.set(key, value),
        })
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let reply: Option<String> = self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl))
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn delete(&self, key: &str) -> KvResult<bool> {
        let removed: i64 = self.with_connection(|conn| conn.del(key))?;
        Ok(removed > 0)
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> KvResult<bool> {
        let removed: i64 = self.with_connection(|conn| {
            DELETE_IF_EQUALS.key(key).arg(expected).invoke(conn)
        })?;
        Ok(removed > 0)
    }

    fn incr(&self, key: &str) -> KvResult<i64> {
        self.with_connection(|conn| conn.incr(key, 1_i64))
    }

    fn set_bit(&self, key: &str, offset: u64, bit: bool) -> KvResult<bool> {
        let offset = bit_offset(offset)?;
        self.with_connection(|conn| conn.setbit(key, offset, bit))
    }

    fn get_bit(&self, key: &str, offset: u64) -> KvResult<bool> {
        let offset = bit_offset(offset)?;
        self.with_connection(|conn| conn.getbit(key, offset))
    }

    fn get_unsigned_bits(&self, key: &str, width: u8) -> KvResult<u64> {
        check_bitfield_width(width)?;
        let reply: Vec<Option<i64>> = self.with_connection(|conn| {
            redis::cmd("BITFIELD")
                .arg(key)
                .arg("GET")
                .arg(format!("u{width}"))
                .arg(0)
                .query(conn)
        })?;
        let value = reply.into_iter().next().flatten().unwrap_or(0);
        u64::try_from(value).map_err(|_| KvError::Backend(format!("negative bit field {value}")))
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        let _: i64 = self.with_connection(|conn| conn.zadd(key, member, score))?;
        Ok(())
    }

    fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let removed: i64 = self.with_connection(|conn| conn.zrem(key, member))?;
        Ok(removed > 0)
    }

    fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        self.with_connection(|conn| conn.zscore(key, member))
    }

    fn zrev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: usize,
    ) -> KvResult<Vec<(String, f64)>> {
        self.with_connection(|conn| {
            redis::cmd("ZREVRANGEBYSCORE")
                .arg(key)
                .arg(max)
                .arg(min)
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(offset)
                .arg(count)
                .query(conn)
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let updated: i64 = self.with_connection(|conn| {
            redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)).query(conn)
        })?;
        Ok(updated == 1)
    }

    fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let remaining: i64 =
            self.with_connection(|conn| redis::cmd("PTTL").arg(key).query(conn))?;
        // -2: missing key, -1: no expiry.
        if remaining < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(remaining as u64)))
    }
}
