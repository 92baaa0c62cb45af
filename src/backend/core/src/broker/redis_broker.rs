//! Redis broker.
//!
//! Key layout under the configured prefix:
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `{prefix}queue:{name}` | list | JSON `TaskMessage`s, RPUSH / BLPOP |
//! | `{prefix}scheduled` | sorted set | delayed messages scored by eta (ms) |
//! | `{prefix}state:{id}` | hash | `state` and the JSON `BrokerTaskInfo` under `info` |
//! | `{prefix}revoked` | hash | job id to JSON `Revocation` |

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use super::{Broker, BrokerState, BrokerTaskInfo, DispatchToken, Revocation, TaskMessage};
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::jobs::JobId;

/// State hashes outlive the task expiry by this much.
const STATE_GRACE: Duration = Duration::from_secs(24 * 3600);

/// State hash lifetime when the message carries no expiry.
const DEFAULT_STATE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Moves due members of the scheduled set onto their queues atomically.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, payload in ipairs(due) do
    local message = cjson.decode(payload)
    redis.call('ZREM', KEYS[1], payload)
    redis.call('RPUSH', ARGV[2] .. 'queue:' .. message['queue'], payload)
end
return #due
"#;

pub struct RedisBroker {
    client: redis::Client,
    prefix: String,
}

impl RedisBroker {
    /// Build a client for `config.url`. No connection is made until first use.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}queue:{}", self.prefix, queue)
    }

    fn scheduled_key(&self) -> String {
        format!("{}scheduled", self.prefix)
    }

    fn state_key(&self, job_id: JobId) -> String {
        format!("{}state:{}", self.prefix, job_id)
    }

    fn revoked_key(&self) -> String {
        format!("{}revoked", self.prefix)
    }

    fn state_ttl(message: &TaskMessage) -> u64 {
        let remaining = message
            .expires_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .map(|d| d + STATE_GRACE)
            .unwrap_or(DEFAULT_STATE_TTL);
        remaining.as_secs().max(1)
    }

    async fn write_state(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: JobId,
        info: &BrokerTaskInfo,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        let key = self.state_key(job_id);
        let payload = serde_json::to_string(info)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("state")
            .arg(info.state.as_str())
            .arg("info")
            .arg(&payload)
            .ignore();
        let ttl = ttl_secs.unwrap_or(DEFAULT_STATE_TTL.as_secs());
        pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();
        pipe.query_async::<_, ()>(conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, message: TaskMessage) -> Result<DispatchToken> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&message)?;
        let job_id = message.job_id;

        let info = BrokerTaskInfo::new(BrokerState::Pending).with_retries(message.retries);
        self.write_state(&mut conn, job_id, &info, Some(Self::state_ttl(&message)))
            .await?;

        match message.eta.filter(|eta| *eta > Utc::now()) {
            Some(eta) => {
                redis::cmd("ZADD")
                    .arg(self.scheduled_key())
                    .arg(eta.timestamp_millis())
                    .arg(&payload)
                    .query_async::<_, i64>(&mut conn)
                    .await?;
            }
            None => {
                redis::cmd("RPUSH")
                    .arg(self.queue_key(&message.queue))
                    .arg(&payload)
                    .query_async::<_, i64>(&mut conn)
                    .await?;
            }
        }

        tracing::debug!(job_id = %job_id, queue = %message.queue, "Message enqueued");
        Ok(DispatchToken(job_id.to_string()))
    }

    async fn query_status(&self, job_id: JobId) -> Result<Option<BrokerTaskInfo>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = redis::cmd("HGET")
            .arg(self.state_key(job_id))
            .arg("info")
            .query_async(&mut conn)
            .await?;

        payload
            .map(|p| serde_json::from_str::<BrokerTaskInfo>(&p))
            .transpose()
            .map_err(Into::into)
    }

    async fn revoke(&self, job_id: JobId, force: bool) -> Result<()> {
        let mut conn = self.conn().await?;
        let revocation = Revocation {
            terminate: force,
            revoked_at: Utc::now(),
        };
        redis::cmd("HSET")
            .arg(self.revoked_key())
            .arg(job_id.to_string())
            .arg(serde_json::to_string(&revocation)?)
            .query_async::<_, i64>(&mut conn)
            .await?;

        let current = self.query_status(job_id).await?;
        let already_done = current.as_ref().map(|i| i.state.is_ready()).unwrap_or(false);
        if !already_done {
            let mut info = current.unwrap_or_else(|| BrokerTaskInfo::new(BrokerState::Pending));
            info.state = BrokerState::Revoked;
            info.completed_at = Some(Utc::now());
            info.updated_at = Utc::now();
            self.write_state(&mut conn, job_id, &info, None).await?;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn fetch(&self, queues: &[String], wait: Duration) -> Result<Option<TaskMessage>> {
        if queues.is_empty() {
            return Ok(None);
        }

        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("BLPOP");
        for queue in queues {
            cmd.arg(self.queue_key(queue));
        }
        cmd.arg(wait.as_secs().max(1));

        let popped: Option<(String, String)> = cmd.query_async(&mut conn).await?;
        match popped {
            Some((_key, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn report(&self, job_id: JobId, info: BrokerTaskInfo) -> Result<()> {
        let mut conn = self.conn().await?;
        self.write_state(&mut conn, job_id, &info, None).await
    }

    async fn revocation(&self, job_id: JobId) -> Result<Option<Revocation>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = redis::cmd("HGET")
            .arg(self.revoked_key())
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await?;

        payload
            .map(|p| serde_json::from_str::<Revocation>(&p))
            .transpose()
            .map_err(Into::into)
    }

    async fn promote_due(&self) -> Result<usize> {
        let mut conn = self.conn().await?;
        let promoted: i64 = redis::Script::new(PROMOTE_SCRIPT)
            .key(self.scheduled_key())
            .arg(Utc::now().timestamp_millis())
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await?;

        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed messages");
        }
        Ok(promoted.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn broker() -> RedisBroker {
        RedisBroker::new(&BrokerConfig {
            key_prefix: "t:".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_key_layout() {
        let broker = broker();
        let id = JobId::new();
        assert_eq!(broker.queue_key("high"), "t:queue:high");
        assert_eq!(broker.scheduled_key(), "t:scheduled");
        assert_eq!(broker.state_key(id), format!("t:state:{}", id));
        assert_eq!(broker.revoked_key(), "t:revoked");
    }

    #[test]
    fn test_state_ttl_covers_expiry() {
        let message = TaskMessage::new(JobId::new(), "noop", vec![], Map::new(), "normal")
            .with_expiry(Duration::from_secs(300));
        let ttl = RedisBroker::state_ttl(&message);
        assert!(ttl > STATE_GRACE.as_secs());
        assert!(ttl <= STATE_GRACE.as_secs() + 300);

        let unbounded = TaskMessage::new(JobId::new(), "noop", vec![], Map::new(), "normal");
        assert_eq!(RedisBroker::state_ttl(&unbounded), DEFAULT_STATE_TTL.as_secs());
    }
}
