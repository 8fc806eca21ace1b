//! Notification routing from a piped configuration to a webhook

use std::collections::HashMap;
use std::time::Duration;

use piped_model::notification::DeploymentEventData;
use piped_model::{Deployment, NotificationEvent, NotificationEventMetadata, NotificationEventType};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use piped::config::piped::PipedConfig;
use piped::notifier::{self, Notifier};

fn piped_config(webhook_url: &str) -> String {
    format!(
        r#"
apiVersion: pipecd.dev/v1beta1
kind: Piped
spec:
  projectID: project-1
  pipedID: piped-1
  pipedKeyData: c2VjcmV0
  apiAddress: localhost:9443
  notifications:
    routes:
      - name: dev-deployments
        receiver: hook
        labels:
          env: dev
        ignoreLabels:
          env: local
    receivers:
      - name: hook
        webhook:
          url: {}/events
          signatureValue: s3cret
"#,
        webhook_url
    )
}

fn deployment_event(app: &str, env: &str) -> NotificationEvent {
    NotificationEvent::new(
        NotificationEventType::DeploymentTriggered,
        NotificationEventMetadata::Deployment(DeploymentEventData {
            deployment: Deployment {
                application_name: app.to_string(),
                labels: HashMap::from([("env".to_string(), env.to_string())]),
                ..Default::default()
            },
            summary: String::new(),
            reason: String::new(),
            mentioned_accounts: Vec::new(),
            mentioned_groups: Vec::new(),
        }),
    )
}

#[tokio::test]
async fn test_routed_events_reach_the_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .and(header("Pipecd-Signature", "s3cret"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let piped = PipedConfig::parse(&piped_config(&server.uri())).unwrap();
    let notifier = std::sync::Arc::new(
        Notifier::new(&piped, "v1.0.0", notifier::Options::default())
            .await
            .unwrap(),
    );
    let cancel = CancellationToken::new();
    let handle = {
        let (notifier, cancel) = (notifier.clone(), cancel.clone());
        tokio::spawn(async move { notifier.run(cancel).await })
    };

    notifier.notify(deployment_event("canary", "dev"));
    notifier.notify(deployment_event("sandbox", "local"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    cancel.cancel();
    assert_ok!(handle.await.unwrap());

    // Events after close are dropped.
    notifier.notify(deployment_event("late", "dev"));

    let requests = server.received_requests().await.unwrap();
    let types: Vec<String> = requests
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["type"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(
        types,
        vec!["PIPED_STARTED", "DEPLOYMENT_TRIGGERED", "PIPED_STOPPED"]
    );

    let body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(body["metadata"]["deployment"]["applicationName"], "canary");
}
