//! Alert notification transports.
//!
//! One [`AlertNotifier`] per channel type. The manager looks the notifier up
//! by the channel's type and hands it the channel's own settings, so a rule
//! can address several webhooks through one shared HTTP client.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use super::rules::{Alert, ChannelKind, ChannelType};
use crate::clock::to_rfc3339;

/// Why a delivery failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("delivery timed out after {0}ms")]
    Timeout(u64),

    #[error("channel misconfigured: {0}")]
    Misconfigured(String),

    #[error("mail transport failed: {0}")]
    Mail(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Notification future type.
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// Service identity included in outbound payloads.
#[derive(Debug, Clone, Serialize)]
pub struct NotifyContext {
    pub service: String,
    pub environment: String,
}

/// Delivers alerts for one channel type.
pub trait AlertNotifier: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    fn notify<'a>(&'a self, channel: &'a ChannelKind, alert: &'a Alert) -> NotifyFuture<'a>;
}

/// Writes one line per alert to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl AlertNotifier for ConsoleNotifier {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Console
    }

    fn notify<'a>(&'a self, _channel: &'a ChannelKind, alert: &'a Alert) -> NotifyFuture<'a> {
        eprintln!(
            "[ALERT:{}] {} (rule={}, value={:.2}, threshold={})",
            alert.severity.as_str().to_uppercase(),
            alert.message,
            alert.rule_id,
            alert.current_value,
            alert.threshold
        );
        Box::pin(async { Ok(()) })
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &BTreeMap<String, String>,
    body: &serde_json::Value,
) -> Result<(), NotifyError> {
    let mut request = client.post(url).json(body);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(NotifyError::Status(status.as_u16()))
    }
}

/// POSTs `{alert, service, environment}` to the channel URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    context: NotifyContext,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, context: NotifyContext) -> Self {
        Self { client, context }
    }
}

pub(crate) fn webhook_payload(alert: &Alert, context: &NotifyContext) -> serde_json::Value {
    json!({
        "alert": alert,
        "service": context.service,
        "environment": context.environment,
    })
}

impl AlertNotifier for WebhookNotifier {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    fn notify<'a>(&'a self, channel: &'a ChannelKind, alert: &'a Alert) -> NotifyFuture<'a> {
        Box::pin(async move {
            let ChannelKind::Webhook { url, headers } = channel else {
                return Err(NotifyError::Misconfigured("expected webhook channel".into()));
            };
            let body = webhook_payload(alert, &self.context);
            post_json(&self.client, url, headers, &body).await
        })
    }
}

/// Slack incoming-webhook notifier.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    context: NotifyContext,
}

impl SlackNotifier {
    pub fn new(client: reqwest::Client, context: NotifyContext) -> Self {
        Self { client, context }
    }
}

pub(crate) fn slack_payload(alert: &Alert, context: &NotifyContext) -> serde_json::Value {
    json!({
        "text": format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.message),
        "attachments": [{
            "color": alert.severity.color(),
            "fields": [
                { "title": "Metric", "value": alert.metric, "short": true },
                { "title": "Current value", "value": format!("{:.2}", alert.current_value), "short": true },
                { "title": "Threshold", "value": alert.threshold.to_string(), "short": true },
                { "title": "Environment", "value": context.environment, "short": true },
            ],
            "footer": context.service,
            "ts": alert.timestamp_ms / 1000,
        }],
    })
}

impl AlertNotifier for SlackNotifier {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Slack
    }

    fn notify<'a>(&'a self, channel: &'a ChannelKind, alert: &'a Alert) -> NotifyFuture<'a> {
        Box::pin(async move {
            let ChannelKind::Slack { webhook_url } = channel else {
                return Err(NotifyError::Misconfigured("expected slack channel".into()));
            };
            let body = slack_payload(alert, &self.context);
            post_json(&self.client, webhook_url, &BTreeMap::new(), &body).await
        })
    }
}

/// Rendered email ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound mail delivery. Sending mail is outside this crate; hosts plug
/// their provider in here.
pub trait MailTransport: Send + Sync {
    fn send<'a>(&'a self, message: &'a EmailMessage) -> NotifyFuture<'a>;
}

/// Records each message in the process log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailTransport;

impl MailTransport for LogMailTransport {
    fn send<'a>(&'a self, message: &'a EmailMessage) -> NotifyFuture<'a> {
        info!(to = %message.to, subject = %message.subject, "alert email queued");
        Box::pin(async { Ok(()) })
    }
}

/// Renders alerts as email and passes them to a [`MailTransport`].
pub struct EmailNotifier {
    transport: Arc<dyn MailTransport>,
    context: NotifyContext,
}

impl std::fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailNotifier")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl EmailNotifier {
    pub fn new(transport: Arc<dyn MailTransport>, context: NotifyContext) -> Self {
        Self { transport, context }
    }
}

pub(crate) fn render_email(
    alert: &Alert,
    to: &str,
    subject: Option<&str>,
    context: &NotifyContext,
) -> EmailMessage {
    let subject = subject.map_or_else(
        || {
            format!(
                "[{}] {} alert: {}",
                context.environment,
                alert.severity.as_str().to_uppercase(),
                alert.rule_id
            )
        },
        str::to_string,
    );
    let body = format!(
        "{}\n\nService: {}\nEnvironment: {}\nMetric: {}\nCurrent value: {:.2}\nThreshold: {}\nRaised at: {}\nAlert id: {}\n",
        alert.message,
        context.service,
        context.environment,
        alert.metric,
        alert.current_value,
        alert.threshold,
        to_rfc3339(alert.timestamp_ms),
        alert.id,
    );
    EmailMessage {
        to: to.to_string(),
        subject,
        body,
    }
}

impl AlertNotifier for EmailNotifier {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    fn notify<'a>(&'a self, channel: &'a ChannelKind, alert: &'a Alert) -> NotifyFuture<'a> {
        Box::pin(async move {
            let ChannelKind::Email { to, subject } = channel else {
                return Err(NotifyError::Misconfigured("expected email channel".into()));
            };
            let message = render_email(alert, to, subject.as_deref(), &self.context);
            self.transport.send(&message).await
        })
    }
}

/// Notifiers by channel type.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    notifiers: BTreeMap<ChannelType, Arc<dyn AlertNotifier>>,
}

impl std::fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.notifiers.keys()).finish()
    }
}

impl NotifierRegistry {
    /// Console, webhook, Slack, and log-backed email.
    pub fn standard(context: NotifyContext, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::default()
            .with(Arc::new(ConsoleNotifier))
            .with(Arc::new(WebhookNotifier::new(client.clone(), context.clone())))
            .with(Arc::new(SlackNotifier::new(client, context.clone())))
            .with(Arc::new(EmailNotifier::new(
                Arc::new(LogMailTransport),
                context,
            ))))
    }

    /// Register `notifier`, replacing any existing one for its channel type.
    #[must_use]
    pub fn with(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifiers.insert(notifier.channel_type(), notifier);
        self
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn AlertNotifier>> {
        self.notifiers.get(&channel_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

/// Deliver one alert on one channel, bounded by `timeout`.
pub(crate) async fn deliver(
    notifier: Arc<dyn AlertNotifier>,
    channel: ChannelKind,
    alert: Alert,
    timeout: Duration,
) -> Result<(), NotifyError> {
    let outcome = match tokio::time::timeout(timeout, notifier.notify(&channel, &alert)).await {
        Ok(result) => result,
        Err(_) => Err(NotifyError::Timeout(timeout.as_millis() as u64)),
    };
    if let Err(err) = &outcome {
        error!(
            alert_id = %alert.id,
            rule_id = %alert.rule_id,
            channel = channel.channel_type().as_str(),
            error = %err,
            "alert notification failed"
        );
    }
    outcome
}
