use serde_json::json;
use wiremock::matchers::{body_string, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use volai::config::NotifierConfig;
use volai::notifier::{ChannelOutcome, Notifier, CHANNEL_CHAT, CHANNEL_EMAIL, CHANNEL_MESSAGING};

fn config(server: &MockServer) -> NotifierConfig {
    NotifierConfig {
        timeout_secs: 5,
        messaging_api_url: format!("{}/api/notify", server.uri()),
        webhook_url: Some(format!("{}/hook", server.uri())),
        ..NotifierConfig::default()
    }
}

#[tokio::test]
/// The chat webhook receives the rendered body as `text`; other channels
/// without credentials are skipped and do not affect the result.
async fn chat_webhook_delivers_json_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string_contains("promoted"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = Notifier::from_config(config(&server));
    let report = notifier
        .notify_all("[volai] 1 model(s) promoted", &json!({ "run_id": "r1" }))
        .await;

    assert!(report.ok_any);
    assert_eq!(report.channels[CHANNEL_CHAT], ChannelOutcome::Sent { status: 200 });
    assert!(matches!(
        report.channels[CHANNEL_EMAIL],
        ChannelOutcome::Skipped { .. }
    ));
    assert!(matches!(
        report.channels[CHANNEL_MESSAGING],
        ChannelOutcome::Skipped { .. }
    ));
}

#[tokio::test]
/// A failing channel is reported as failed while a healthy one still sends.
async fn one_failing_channel_does_not_block_another() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/notify"))
        .and(header("authorization", "Bearer line-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(&server);
    cfg.messaging_token = Some("line-token".into());
    let notifier = Notifier::from_config(cfg);
    assert!(notifier.has_any_channel());

    let report = notifier.notify_all("title", &json!({})).await;
    assert!(report.ok_any);
    assert_eq!(
        report.channels[CHANNEL_CHAT],
        ChannelOutcome::Failed {
            error: "HTTP 500".into()
        }
    );
    assert!(report.channels[CHANNEL_MESSAGING].is_sent());
}

#[tokio::test]
/// Every configured channel failing leaves `ok_any` false.
async fn all_failures_report_not_ok() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let notifier = Notifier::from_config(config(&server));
    let report = notifier.notify_all("title", &json!({ "x": 1 })).await;
    assert!(!report.ok_any);
    assert!(matches!(
        report.channels[CHANNEL_CHAT],
        ChannelOutcome::Failed { .. }
    ));
}

#[tokio::test]
/// The messaging channel gets the title and a single compact JSON line, not
/// the fenced block sent to chat and email.
async fn messaging_receives_compact_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string_contains("```json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/notify"))
        .and(body_string("message=title%0A%7B%22x%22%3A1%7D"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(&server);
    cfg.messaging_token = Some("line-token".into());
    let notifier = Notifier::from_config(cfg);
    let report = notifier.notify_all("title", &json!({ "x": 1 })).await;
    assert!(report.channels[CHANNEL_CHAT].is_sent());
    assert!(report.channels[CHANNEL_MESSAGING].is_sent());
}
