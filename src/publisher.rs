/// Publisher
///
/// Best-effort `irn_publish`: transient failures are retried a bounded number
/// of times, anything else goes straight back to the caller.
///
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::error::Result;
use crate::events::{EventBus, SignEvent};
use crate::provider::JsonRpcProvider;
use crate::types::{IrnPublishParams, IrnTag, JsonRpcMethod};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    pub ttl: u64,
    pub tag: IrnTag,
    pub prompt: bool,
}

pub struct Publisher {
    provider: Arc<JsonRpcProvider>,
    retry: RetryPolicy,
    timeout: Duration,
    events: EventBus,
}

impl Publisher {
    pub fn new(
        provider: Arc<JsonRpcProvider>,
        retry: RetryPolicy,
        timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            provider,
            retry,
            timeout,
            events,
        }
    }

    /// `message` is the already encrypted envelope.
    pub async fn publish(
        &self,
        topic: &str,
        message: &str,
        opts: PublishOptions,
    ) -> Result<()> {
        let params = IrnPublishParams {
            topic: topic.to_string(),
            message: message.to_string(),
            ttl: opts.ttl,
            tag: opts.tag as u16,
            prompt: opts.prompt,
        };

        let mut attempt = 1;
        loop {
            let result: Result<Value> = self
                .provider
                .request(JsonRpcMethod::IrnPublish, &params, self.timeout)
                .await;
            match result {
                Ok(_) => {
                    debug!("published tag {} on {topic}", params.tag);
                    self.events.emit(SignEvent::PublishedMessage {
                        topic: params.topic,
                        message: params.message,
                        tag: params.tag,
                    });
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!("publish on {topic} failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
