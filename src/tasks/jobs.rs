//! Forwarding jobs to legacy job queues.

use crate::error::DockhandResult;
use crate::queue::producer::{LegacyJob, LegacyJobClient};
use crate::task::{DockhandTask, TaskContext, TaskResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Legacy queue consuming SMS v2 jobs.
pub const SMS_V2_QUEUE: &str = "sweeper_sms_v2";

/// Job method the legacy SMS consumer dispatches on.
pub const SMS_V2_METHOD: &str = "send_sms_v2";

fn empty_message() -> String {
    "Empty".to_string()
}

/// Arguments of an SMS v2 job. Missing fields default to empty strings,
/// the message to `"Empty"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsV2 {
    /// Recipient user
    #[serde(default)]
    pub user_id: String,
    /// Recipient phone number
    #[serde(default)]
    pub phone_number: String,
    /// Phone number country code
    #[serde(default)]
    pub country_code: String,
    /// Message text
    #[serde(default = "empty_message")]
    pub message: String,
    /// SMS category
    #[serde(default)]
    pub sms_type: String,
    /// Campaign the SMS belongs to
    #[serde(default)]
    pub campaign_id: String,
}

/// A job bound for a legacy queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuedJob {
    /// SMS v2
    SmsV2(SmsV2),
}

impl QueuedJob {
    /// Short legacy queue name.
    pub fn queue(&self) -> &'static str {
        match self {
            QueuedJob::SmsV2(_) => SMS_V2_QUEUE,
        }
    }

    /// The job in the legacy wire shape.
    pub fn to_legacy_job(&self) -> LegacyJob {
        match self {
            QueuedJob::SmsV2(sms) => LegacyJob::new(
                SMS_V2_METHOD,
                vec![
                    Value::from(sms.user_id.as_str()),
                    Value::from(sms.phone_number.as_str()),
                    Value::from(sms.country_code.as_str()),
                    Value::from(sms.message.as_str()),
                    Value::from(sms.sms_type.as_str()),
                    Value::from(sms.campaign_id.as_str()),
                ],
            ),
        }
    }

    /// Queue the job on its legacy queue and return the message id.
    pub async fn process(&self, jobs: &LegacyJobClient) -> DockhandResult<String> {
        jobs.queue_job(self.queue(), &self.to_legacy_job()).await
    }
}

/// `queued_task(job)`: forward `job` to its legacy queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    /// The job to forward
    pub job: QueuedJob,
}

#[async_trait]
impl DockhandTask for QueuedTask {
    const NAME: &'static str = "queued_task";
    type Output = String;

    async fn run(self, ctx: &TaskContext) -> TaskResult<String> {
        Ok(self.job.process(&ctx.jobs).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::codec;
    use crate::tasks::tests::ctx_with_transport;
    use crate::queue::InMemoryTransport;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_sms_defaults() {
        let job: QueuedJob = serde_json::from_value(json!({
            "type": "sms_v2",
            "user_id": "u1",
            "phone_number": "555"
        }))
        .unwrap();

        let legacy = job.to_legacy_job();
        assert_eq!(legacy.name, "send_sms_v2");
        assert_eq!(legacy.args, vec![json!("u1"), json!("555"), json!(""), json!("Empty"), json!(""), json!("")]);
    }

    #[tokio::test]
    async fn test_job_is_forwarded_to_legacy_queue() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = ctx_with_transport(transport.clone());

        let task: QueuedTask = serde_json::from_value(json!({
            "job": {"type": "sms_v2", "user_id": "u1", "message": "hi"}
        }))
        .unwrap();
        task.run(&ctx).await.unwrap();

        let stored = transport.peek("test_sweeper_sms_v2").await;
        assert_eq!(stored.len(), 1);
        let body: Value = codec::decode(&stored[0].body, &stored[0].attributes).unwrap();
        assert_eq!(body[0], "send_sms_v2");
        assert_eq!(body[1][3], "hi");
        assert!(body[2]["_queued_time"].as_f64().unwrap() > 0.0);
    }
}
