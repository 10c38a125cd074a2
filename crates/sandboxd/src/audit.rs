use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use sandbox::{ExecutionResult, Outcome, Phase};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::types::serialize_iso;

/// Timeout for a single webhook delivery.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// How long shutdown waits for queued events to go out.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum AuditEvent {
    Submitted {
        id: Uuid,
        language: String,
        source_bytes: usize,
    },
    Executed {
        id: Uuid,
        language: String,
        outcome: Outcome,
        phase: Phase,
        exit_code: Option<i32>,
        duration_ms: u64,
        truncated: bool,
    },
    Reclaimed {
        id: Uuid,
        forced: bool,
    },
}

impl AuditEvent {
    pub fn executed(id: Uuid, language: &str, result: &ExecutionResult) -> Self {
        Self::Executed {
            id,
            language: language.to_string(),
            outcome: result.outcome,
            phase: result.phase,
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            truncated: result.truncated,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    #[serde(serialize_with = "serialize_iso")]
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Fire-and-forget sink for audit events. Recording never waits: events go
/// into a bounded queue and are dropped with a warning when it is full.
#[derive(Clone, Default)]
pub struct AuditHook {
    tx: Option<mpsc::Sender<AuditEvent>>,
}

impl AuditHook {
    /// Log events at debug level instead of delivering them.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Start the delivery task. It drains what is queued and exits once
    /// `shutdown` fires.
    pub fn spawn(
        config: &AuditConfig,
        shutdown: CancellationToken,
    ) -> ServiceResult<(Self, JoinHandle<()>)> {
        let client = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::Internal(format!("audit http client: {e}")))?;
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let sink = WebhookSink {
            client,
            url: config.url.clone(),
            token: config.token.clone(),
        };
        info!(queue_size = config.queue_size, "audit webhook enabled");
        let handle = tokio::spawn(sink.run(rx, shutdown));
        Ok((Self { tx: Some(tx) }, handle))
    }

    pub fn record(&self, event: AuditEvent) {
        let Some(tx) = &self.tx else {
            debug!(event = ?event, "audit");
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = ?event, "audit queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("audit sink stopped, dropping event");
            }
        }
    }
}

struct WebhookSink {
    client: Client,
    url: String,
    token: Option<String>,
}

impl WebhookSink {
    async fn run(self, mut rx: mpsc::Receiver<AuditEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.deliver(&event).await,
                    None => return,
                },
                _ = shutdown.cancelled() => break,
            }
        }

        rx.close();
        let flush = async {
            while let Some(event) = rx.recv().await {
                self.deliver(&event).await;
            }
        };
        if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
            warn!("audit flush timed out, remaining events dropped");
        }
    }

    async fn deliver(&self, event: &AuditEvent) {
        let envelope = Envelope {
            at: Utc::now(),
            event,
        };
        let mut req = self.client.post(&self.url).json(&envelope);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "audit delivery rejected");
            }
            Err(e) => {
                warn!(error = %e.without_url(), "audit delivery failed");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_and_camel_case() {
        let id = Uuid::nil();
        let json = serde_json::to_value(AuditEvent::Submitted {
            id,
            language: "python".into(),
            source_bytes: 12,
        })
        .unwrap();
        assert_eq!(json["event"], "submitted");
        assert_eq!(json["sourceBytes"], 12);

        let json = serde_json::to_value(AuditEvent::Reclaimed { id, forced: true }).unwrap();
        assert_eq!(json["event"], "reclaimed");
        assert_eq!(json["forced"], true);
    }

    #[test]
    fn envelope_adds_timestamp() {
        let event = AuditEvent::Reclaimed {
            id: Uuid::nil(),
            forced: false,
        };
        let json = serde_json::to_value(Envelope {
            at: Utc::now(),
            event: &event,
        })
        .unwrap();
        assert_eq!(json["event"], "reclaimed");
        assert!(json["at"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let hook = AuditHook { tx: Some(tx) };
        for _ in 0..3 {
            hook.record(AuditEvent::Reclaimed {
                id: Uuid::nil(),
                forced: false,
            });
        }
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_hook_accepts_events() {
        AuditHook::disabled().record(AuditEvent::Reclaimed {
            id: Uuid::nil(),
            forced: false,
        });
    }
}
