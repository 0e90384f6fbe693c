//! Alert notifications for escalated events

use crate::config::AlertConfig;
use crate::detector::{Event, Severity};
use tracing::{info, warn};

/// Send alert through configured channels
pub async fn send_alert(event: &Event, config: &AlertConfig) -> anyhow::Result<()> {
    // Desktop notification
    if config.desktop {
        if let Err(e) = send_desktop_notification(event) {
            warn!("Failed to send desktop notification: {}", e);
        }
    }

    // Webhook
    if let Some(ref url) = config.webhook {
        if let Err(e) = send_webhook(event, url).await {
            warn!("Failed to send webhook: {}", e);
        }
    }

    // Slack
    if let Some(ref url) = config.slack {
        if let Err(e) = send_slack(event, url).await {
            warn!("Failed to send Slack alert: {}", e);
        }
    }

    Ok(())
}

/// Send desktop notification
fn send_desktop_notification(event: &Event) -> anyhow::Result<()> {
    let title = match event.severity() {
        Severity::Critical => "🚨 Hostwarden alert",
        Severity::Warning => "⚠️ Hostwarden warning",
        Severity::Info => "ℹ️ Hostwarden notice",
    };

    let body = format!("{}\n{}\n{}", event.kind, event.subject, event.detail);

    notify_rust::Notification::new()
        .summary(title)
        .body(&body)
        .icon("dialog-warning")
        .urgency(notify_rust::Urgency::Critical)
        .timeout(notify_rust::Timeout::Never)
        .show()?;

    info!("Sent desktop notification");

    Ok(())
}

/// Send webhook notification
#[cfg(feature = "reqwest")]
async fn send_webhook(event: &Event, url: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "severity": format!("{:?}", event.severity()),
        "kind": event.kind,
        "subject": event.subject,
        "detail": event.detail,
        "timestamp": event.timestamp.to_rfc3339(),
    });

    let client = reqwest::Client::new();
    client.post(url).json(&payload).send().await?.error_for_status()?;

    info!("Sent webhook notification to {}", url);

    Ok(())
}

#[cfg(not(feature = "reqwest"))]
async fn send_webhook(_event: &Event, _url: &str) -> anyhow::Result<()> {
    warn!("Webhook support not compiled in (requires 'reqwest' feature)");
    Ok(())
}

/// Send Slack notification
#[cfg(feature = "reqwest")]
async fn send_slack(event: &Event, webhook_url: &str) -> anyhow::Result<()> {
    let color = match event.severity() {
        Severity::Critical => "#FF0000",
        Severity::Warning => "#FFA500",
        Severity::Info => "#00FF00",
    };

    let payload = serde_json::json!({
        "attachments": [{
            "color": color,
            "title": format!("🛡️ Hostwarden: {}", event.kind),
            "fields": [
                {
                    "title": "Subject",
                    "value": &event.subject,
                    "short": false
                },
                {
                    "title": "Details",
                    "value": &event.detail,
                    "short": false
                }
            ],
            "footer": "Hostwarden",
            "ts": event.timestamp.timestamp()
        }]
    });

    let client = reqwest::Client::new();
    client.post(webhook_url).json(&payload).send().await?.error_for_status()?;

    info!("Sent Slack notification");

    Ok(())
}

#[cfg(not(feature = "reqwest"))]
async fn send_slack(_event: &Event, _url: &str) -> anyhow::Result<()> {
    warn!("Slack support not compiled in (requires 'reqwest' feature)");
    Ok(())
}
