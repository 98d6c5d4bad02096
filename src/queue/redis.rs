//! Redis-backed job queue.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::time::Instant;
use tracing::debug;

use self::keys::QueueKeys;
use super::{new_token, poll_step, Claim, JobQueue, QueueError};

/// Redis keys of one queue
pub mod keys {
    /// Prefix of the production queue
    pub const DEFAULT_PREFIX: &str = "judge:queue";

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct QueueKeys {
        /// Pending submission IDs (LPUSH in, RPOP out)
        pub queue: String,
        /// Claim token -> visibility deadline (ms since epoch, server clock)
        pub claims: String,
        /// Claim token -> submission ID
        pub tokens: String,
        /// Submission ID -> delivery count
        pub deliveries: String,
    }

    impl QueueKeys {
        pub fn new(prefix: &str) -> Self {
            Self {
                queue: prefix.to_string(),
                claims: format!("{}:claims", prefix),
                tokens: format!("{}:tokens", prefix),
                deliveries: format!("{}:deliveries", prefix),
            }
        }
    }

    impl Default for QueueKeys {
        fn default() -> Self {
            Self::new(DEFAULT_PREFIX)
        }
    }
}

/// Reclaim one expired claim, or pop the next pending job, and claim it
/// under ARGV[2]. Returns `{id, deliveries}` or nil.
const CLAIM_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local id = false
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, 1)
if #expired > 0 then
  id = redis.call('HGET', KEYS[3], expired[1])
  redis.call('ZREM', KEYS[2], expired[1])
  redis.call('HDEL', KEYS[3], expired[1])
end
if not id then
  id = redis.call('RPOP', KEYS[1])
end
if not id then
  return false
end
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), ARGV[2])
redis.call('HSET', KEYS[3], ARGV[2], id)
local deliveries = redis.call('HINCRBY', KEYS[4], id, 1)
return {id, deliveries}
"#;

/// Move an existing claim's deadline to now + ARGV[1]. Returns 1 when the
/// claim was still held.
const EXTEND_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[2]) then
  return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZADD', KEYS[1], 'XX', now + tonumber(ARGV[1]), ARGV[2])
return 1
"#;

/// Drop a claim if it is still ours. Returns 1 when it was.
const ACK_SCRIPT: &str = r#"
local id = redis.call('HGET', KEYS[2], ARGV[1])
if not id then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], id)
return 1
"#;

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: QueueKeys,
    claim_script: Script,
    extend_script: Script,
    ack_script: Script,
    visibility_timeout: Duration,
    request_timeout: Duration,
}

impl RedisQueue {
    pub fn new(
        conn: ConnectionManager,
        visibility_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            keys: QueueKeys::default(),
            claim_script: Script::new(CLAIM_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            visibility_timeout,
            request_timeout,
        }
    }

    /// Use the keys under `prefix` instead of [`keys::DEFAULT_PREFIX`].
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.keys = QueueKeys::new(prefix);
        self
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    fn visibility_ms(&self) -> u64 {
        self.visibility_timeout.as_millis() as u64
    }

    async fn try_claim(&self) -> Result<Option<Claim>, QueueError> {
        let token = new_token();
        let mut invocation = self.claim_script.prepare_invoke();
        invocation
            .key(&self.keys.queue)
            .key(&self.keys.claims)
            .key(&self.keys.tokens)
            .key(&self.keys.deliveries)
            .arg(self.visibility_ms())
            .arg(&token);

        let mut conn = self.conn.clone();
        let claimed: Option<(String, u32)> = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;

        claimed
            .map(|(id, deliveries)| {
                let submission_id = id
                    .parse()
                    .map_err(|_| QueueError::Corrupt(format!("non-numeric job id {:?}", id)))?;
                Ok(Claim {
                    token,
                    submission_id,
                    deliveries,
                })
            })
            .transpose()
    }

    async fn bounded<T, F>(&self, request: F) -> Result<T, QueueError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueueError::Unavailable(format!(
                "request timed out after {:?}",
                self.request_timeout
            ))),
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, submission_id: i64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let key = self.keys.queue.clone();
        self.bounded(async move { conn.lpush::<_, _, ()>(&key, submission_id).await })
            .await
    }

    async fn dequeue(&self, poll: Duration) -> Result<Option<Claim>, QueueError> {
        let give_up = Instant::now() + poll;
        loop {
            if let Some(claim) = self.try_claim().await? {
                debug!(
                    "Claimed submission_id={} (delivery {})",
                    claim.submission_id, claim.deliveries
                );
                return Ok(Some(claim));
            }
            if Instant::now() >= give_up {
                return Ok(None);
            }
            tokio::time::sleep(poll_step(poll).min(give_up - Instant::now())).await;
        }
    }

    async fn extend(&self, claim: &Claim) -> Result<bool, QueueError> {
        let mut invocation = self.extend_script.prepare_invoke();
        invocation
            .key(&self.keys.claims)
            .arg(self.visibility_ms())
            .arg(&claim.token);

        let mut conn = self.conn.clone();
        let extended: i64 = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(extended == 1)
    }

    async fn acknowledge(&self, claim: &Claim) -> Result<(), QueueError> {
        let mut invocation = self.ack_script.prepare_invoke();
        invocation
            .key(&self.keys.claims)
            .key(&self.keys.tokens)
            .key(&self.keys.deliveries)
            .arg(&claim.token);

        let mut conn = self.conn.clone();
        let removed: i64 = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;
        if removed == 0 {
            debug!(
                "Claim for submission_id={} had already expired",
                claim.submission_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Queue on a throwaway prefix, or `None` when no Redis is reachable.
    async fn test_queue(visibility: Duration) -> Option<RedisQueue> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url).ok()?;
        let conn = match tokio::time::timeout(
            Duration::from_secs(1),
            ConnectionManager::new(client),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            _ => {
                eprintln!("redis not reachable, skipping");
                return None;
            }
        };
        let prefix = format!("test:{}:judge:queue", new_token());
        Some(RedisQueue::new(conn, visibility, Duration::from_secs(2)).with_prefix(&prefix))
    }

    async fn cleanup(queue: &RedisQueue) {
        let keys = queue.keys().clone();
        let mut conn = queue.conn.clone();
        let _: redis::RedisResult<()> = conn
            .del(vec![keys.queue, keys.claims, keys.tokens, keys.deliveries])
            .await;
    }

    #[tokio::test]
    async fn test_fifo_claim_and_acknowledge() {
        let Some(queue) = test_queue(Duration::from_secs(30)).await else {
            return;
        };
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!((first.submission_id, second.submission_id), (1, 2));
        assert_eq!(first.deliveries, 1);

        queue.acknowledge(&first).await.unwrap();
        queue.acknowledge(&second).await.unwrap();
        assert!(queue.dequeue(Duration::from_millis(100)).await.unwrap().is_none());
        cleanup(&queue).await;
    }

    #[tokio::test]
    async fn test_expired_claim_is_reclaimed_and_stale_ack_is_ignored() {
        let Some(queue) = test_queue(Duration::from_millis(100)).await else {
            return;
        };
        queue.enqueue(9).await.unwrap();

        let stale = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(queue.dequeue(Duration::from_millis(50)).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let current = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(current.submission_id, 9);
        assert_eq!(current.deliveries, 2);
        assert_ne!(current.token, stale.token);

        // The stale token neither extends nor removes the new claim
        assert!(!queue.extend(&stale).await.unwrap());
        queue.acknowledge(&stale).await.unwrap();
        assert!(queue.extend(&current).await.unwrap());

        queue.acknowledge(&current).await.unwrap();
        assert!(!queue.extend(&current).await.unwrap());
        cleanup(&queue).await;
    }

    #[tokio::test]
    async fn test_extended_claim_stays_invisible() {
        let Some(queue) = test_queue(Duration::from_millis(150)).await else {
            return;
        };
        queue.enqueue(4).await.unwrap();
        let claim = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(75)).await;
            assert!(queue.extend(&claim).await.unwrap());
        }
        assert!(queue.dequeue(Duration::from_millis(50)).await.unwrap().is_none());
        queue.acknowledge(&claim).await.unwrap();
        cleanup(&queue).await;
    }
}
