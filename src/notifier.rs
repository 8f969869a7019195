//! Best-effort fan-out of scheduler events to chat, email and messaging.
//!
//! Channels run concurrently and independently. A channel without
//! credentials is skipped, a failing one is reported, neither affects the
//! others or the caller.

use std::collections::BTreeMap;
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::Serialize;
use serde_json::json;

use crate::config::{NotifierConfig, SmtpConfig};

pub const CHANNEL_CHAT: &str = "chat";
pub const CHANNEL_EMAIL: &str = "email";
pub const CHANNEL_MESSAGING: &str = "messaging";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Sent { status: u16 },
    Skipped { reason: String },
    Failed { error: String },
}

impl ChannelOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }

    fn skipped(reason: &str) -> Self {
        Self::Skipped {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotifyReport {
    pub channels: BTreeMap<String, ChannelOutcome>,
    pub ok_any: bool,
}

/// Title line followed by the payload as a fenced JSON block.
pub fn render_body(title: &str, payload: &serde_json::Value) -> String {
    let pretty = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
    format!("{}\n```json\n{}\n```", title, pretty)
}

/// Title line followed by the payload as one line of compact JSON, for the
/// messaging channel.
pub fn render_compact(title: &str, payload: &serde_json::Value) -> String {
    format!("{}\n{}", title, payload)
}

pub struct Notifier {
    cfg: NotifierConfig,
    http: reqwest::Client,
}

impl Notifier {
    pub fn from_config(cfg: NotifierConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { cfg, http }
    }

    pub fn has_any_channel(&self) -> bool {
        self.cfg.webhook_url.is_some() || self.cfg.smtp.is_some() || self.cfg.messaging_token.is_some()
    }

    pub async fn send_chat(&self, text: &str) -> ChannelOutcome {
        let Some(url) = self.cfg.webhook_url.as_deref() else {
            return ChannelOutcome::skipped("no_webhook");
        };
        let resp = self.http.post(url).json(&json!({ "text": text })).send().await;
        http_outcome(resp)
    }

    pub async fn send_messaging(&self, text: &str) -> ChannelOutcome {
        let Some(token) = self.cfg.messaging_token.as_deref() else {
            return ChannelOutcome::skipped("no_line_token");
        };
        let resp = self
            .http
            .post(&self.cfg.messaging_api_url)
            .bearer_auth(token)
            .form(&[("message", text)])
            .send()
            .await;
        http_outcome(resp)
    }

    pub async fn send_email(&self, subject: &str, body: &str) -> ChannelOutcome {
        let Some(smtp) = self.cfg.smtp.clone() else {
            return ChannelOutcome::skipped("smtp_incomplete_or_no_recipients");
        };
        let timeout = Duration::from_secs(self.cfg.timeout_secs);
        let subject = subject.to_string();
        let body = body.to_string();
        match tokio::task::spawn_blocking(move || send_smtp(&smtp, &subject, &body, timeout)).await {
            Ok(Ok(())) => ChannelOutcome::Sent { status: 250 },
            Ok(Err(e)) => ChannelOutcome::Failed {
                error: format!("{:#}", e),
            },
            Err(e) => ChannelOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    pub async fn notify_all(&self, title: &str, payload: &serde_json::Value) -> NotifyReport {
        let body = render_body(title, payload);
        let compact = render_compact(title, payload);
        let (chat, email, messaging) = tokio::join!(
            self.send_chat(&body),
            self.send_email(title, &body),
            self.send_messaging(&compact),
        );

        let mut channels = BTreeMap::new();
        for (name, outcome) in [
            (CHANNEL_CHAT, chat),
            (CHANNEL_EMAIL, email),
            (CHANNEL_MESSAGING, messaging),
        ] {
            match &outcome {
                ChannelOutcome::Failed { error } => {
                    tracing::warn!(channel = name, error = %error, "notification failed")
                }
                ChannelOutcome::Skipped { reason } => {
                    tracing::debug!(channel = name, reason = %reason, "notification skipped")
                }
                ChannelOutcome::Sent { status } => {
                    tracing::info!(channel = name, status, "notification sent")
                }
            }
            channels.insert(name.to_string(), outcome);
        }
        let ok_any = channels.values().any(ChannelOutcome::is_sent);
        NotifyReport { channels, ok_any }
    }
}

fn http_outcome(resp: Result<reqwest::Response, reqwest::Error>) -> ChannelOutcome {
    match resp {
        Ok(resp) if resp.status().is_success() => ChannelOutcome::Sent {
            status: resp.status().as_u16(),
        },
        Ok(resp) => ChannelOutcome::Failed {
            error: format!("HTTP {}", resp.status().as_u16()),
        },
        Err(e) => ChannelOutcome::Failed {
            error: e.to_string(),
        },
    }
}

fn send_smtp(smtp: &SmtpConfig, subject: &str, body: &str, timeout: Duration) -> anyhow::Result<()> {
    let mut builder = Message::builder()
        .from(smtp.user.parse()?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    for rcpt in &smtp.recipients {
        builder = builder.to(rcpt.parse()?);
    }
    let message = builder.body(body.to_string())?;

    let relay = if smtp.implicit_tls {
        SmtpTransport::relay(&smtp.host)?
    } else {
        SmtpTransport::starttls_relay(&smtp.host)?
    };
    let mailer = relay
        .port(smtp.port)
        .credentials(Credentials::new(smtp.user.clone(), smtp.password.clone()))
        .timeout(Some(timeout))
        .build();
    mailer.send(&message)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_wraps_payload_in_fence() {
        let body = render_body("promoted", &json!({"mae": 0.1}));
        assert!(body.starts_with("promoted\n```json\n"));
        assert!(body.ends_with("\n```"));
        assert!(body.contains("\"mae\": 0.1"));
    }

    #[test]
    fn compact_body_is_title_and_one_json_line() {
        let body = render_compact("promoted", &json!({"mae": 0.1, "n": 50}));
        assert_eq!(body, "promoted\n{\"mae\":0.1,\"n\":50}");
    }

    #[tokio::test]
    async fn unconfigured_channels_are_skipped() {
        let notifier = Notifier::from_config(NotifierConfig::default());
        assert!(!notifier.has_any_channel());
        let report = notifier.notify_all("t", &json!({})).await;
        assert!(!report.ok_any);
        assert_eq!(
            report.channels[CHANNEL_CHAT],
            ChannelOutcome::Skipped {
                reason: "no_webhook".into()
            }
        );
        assert_eq!(
            report.channels[CHANNEL_EMAIL],
            ChannelOutcome::Skipped {
                reason: "smtp_incomplete_or_no_recipients".into()
            }
        );
        assert_eq!(
            report.channels[CHANNEL_MESSAGING],
            ChannelOutcome::Skipped {
                reason: "no_line_token".into()
            }
        );
    }
}
