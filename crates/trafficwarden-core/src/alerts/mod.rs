//! Threshold alerting over metrics, logs and process stats.
//!
//! Rules name a metric, a comparison and a threshold. Each
//! [`AlertManager::check_alerts`] pass reads the metric, raises or resolves
//! alerts, and fans notifications out to the rule's channels. A rule that
//! fires is not evaluated again until its cooldown has elapsed.

mod manager;
pub mod notify;
mod rules;

pub use manager::{AlertManager, AlertStats, CheckSummary};
pub use notify::{
    AlertNotifier, ConsoleNotifier, EmailMessage, EmailNotifier, LogMailTransport, MailTransport,
    NotifierRegistry, NotifyContext, NotifyError, NotifyFuture, SlackNotifier, WebhookNotifier,
};
pub use rules::{
    Alert, AlertMetric, AlertRule, ChannelConfig, ChannelKind, ChannelType, Condition, Severity,
    default_rules,
};
