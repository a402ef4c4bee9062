//! Operator alerts
//!
//! Escalations that need a human (no-auto-recover failures) and test alerts
//! fan out to every configured sink. The log sink is always present.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AlertSettings;
use crate::error::{ResilienceError, ResilienceResult};

/// Alert type used for failures that need manual action
pub const MANUAL_INTERVENTION: &str = "manual_intervention_required";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub alert_type: String,
    pub payload: serde_json::Value,
    /// Sent through `send_test_alert`, not a real incident
    #[serde(default)]
    pub test: bool,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(alert_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            alert_type: alert_type.into(),
            payload,
            test: false,
            created_at: Utc::now(),
        }
    }

    pub fn test(alert_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            test: true,
            ..Self::new(alert_type, payload)
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &Alert) -> ResilienceResult<()>;
}

/// Writes alerts to the tracing log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> ResilienceResult<()> {
        if alert.test {
            tracing::info!("Test alert '{}': {}", alert.alert_type, alert.payload);
        } else {
            tracing::error!("ALERT '{}': {}", alert.alert_type, alert.payload);
        }
        Ok(())
    }
}

/// POSTs the alert as JSON
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ResilienceResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> ResilienceResult<()> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(ResilienceError::NetworkError(format!(
                "alert webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Keeps delivered alerts in memory
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, alert: &Alert) -> ResilienceResult<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

pub struct Alerter {
    sinks: Vec<Arc<dyn AlertSink>>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl Default for Alerter {
    fn default() -> Self {
        Self::new()
    }
}

impl Alerter {
    /// Alerter with only the log sink
    pub fn new() -> Self {
        Self {
            sinks: vec![Arc::new(LogAlertSink)],
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &AlertSettings) -> ResilienceResult<Self> {
        let mut alerter = Self::new();
        if let Some(ref url) = settings.webhook_url {
            let sink = WebhookAlertSink::new(url.clone(), Duration::from_millis(settings.timeout_ms))?;
            alerter = alerter.with_sink(Arc::new(sink));
        }
        Ok(alerter)
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver to every sink. All sinks are attempted; the first failure is
    /// returned.
    pub async fn send(&self, alert: &Alert) -> ResilienceResult<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.send(alert).await {
                tracing::warn!("Alert sink '{}' failed: {}", sink.name(), e);
                self.failed.fetch_add(1, Ordering::Relaxed);
                first_error.get_or_insert(e);
            }
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Verify the wiring without a real incident
    pub async fn send_test(
        &self,
        alert_type: &str,
        payload: serde_json::Value,
    ) -> ResilienceResult<Alert> {
        if alert_type.trim().is_empty() {
            return Err(ResilienceError::BadRequest(
                "alert type must not be empty".to_string(),
            ));
        }
        let alert = Alert::test(alert_type, payload);
        self.send(&alert).await?;
        Ok(alert)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Alerter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alerter")
            .field("sinks", &self.sink_names())
            .field("sent", &self.sent_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _alert: &Alert) -> ResilienceResult<()> {
            Err(ResilienceError::NetworkError("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_send_test_alert() {
        let memory = Arc::new(MemoryAlertSink::new());
        let alerter = Alerter::new().with_sink(memory.clone());

        let alert = alerter
            .send_test("pager", json!({"message": "hello"}))
            .await
            .unwrap();
        assert!(alert.test);

        let delivered = memory.alerts();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].alert_type, "pager");
        assert_eq!(delivered[0].payload["message"], "hello");
        assert_eq!(alerter.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_type_rejected() {
        let alerter = Alerter::new();
        assert!(matches!(
            alerter.send_test("  ", json!({})).await,
            Err(ResilienceError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_others() {
        let memory = Arc::new(MemoryAlertSink::new());
        let alerter = Alerter::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(memory.clone());

        let result = alerter.send(&Alert::new("disk", json!({}))).await;
        assert!(result.is_err());
        assert_eq!(memory.alerts().len(), 1);
        assert_eq!(alerter.failed_count(), 1);
    }

    #[test]
    fn test_from_settings() {
        let alerter = Alerter::from_settings(&AlertSettings {
            webhook_url: Some("http://localhost:9/alerts".into()),
            timeout_ms: 1000,
        })
        .unwrap();
        assert_eq!(alerter.sink_names(), vec!["log", "webhook"]);
    }
}
