//! Trigger, controller and scheduler working against one control plane

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use piped_model::notification::PipedEventData;
use piped_model::{Application, ApplicationGitPath, ApplicationKind, DeploymentStatus, StageStatus};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use piped::commandstore::CommandStore;
use piped::config::piped::PipedConfig;
use piped::controller::{self, Components, Controller};
use piped::executor::Registry;
use piped::filesys::dir::Dir;
use piped::logpersister::Persister;
use piped::notifier::Notifier;
use piped::trigger::{self, Trigger};

use crate::support::{ControlPlane, Remote};

const PIPED_CONFIG: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Piped
spec:
  projectID: project-1
  pipedID: piped-1
  pipedKeyData: c2VjcmV0
  apiAddress: localhost:9443
  repositories:
    - repoId: repo-1
      remote: git@example.com:org/manifests.git
      branch: main
"#;

const APP_CONFIG: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Application
spec:
  name: demo
  pipeline:
    stages:
      - name: WAIT
        with:
          duration: 1m
"#;

fn demo_app() -> Application {
    Application {
        id: "app-1".to_string(),
        name: "demo".to_string(),
        project_id: "project-1".to_string(),
        piped_id: "piped-1".to_string(),
        kind: ApplicationKind::Custom,
        git_path: ApplicationGitPath {
            repo_id: "repo-1".to_string(),
            branch: "main".to_string(),
            path: "apps/demo".to_string(),
            config_filename: None,
        },
        labels: HashMap::new(),
        disabled: false,
    }
}

#[tokio::test(start_paused = true)]
async fn test_commit_is_deployed_through_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(ControlPlane::default());
    let remote = Arc::new(Remote::default());
    let piped = Arc::new(PipedConfig::parse(PIPED_CONFIG).unwrap());
    let notifier = Arc::new(
        Notifier::with_senders(PipedEventData::default(), &[], HashMap::new(), Default::default()).unwrap(),
    );

    api.applications.lock().unwrap().push(demo_app());
    remote.commit("h1", &[("apps/demo/app.pipecd.yaml", APP_CONFIG)]);

    let trigger = Arc::new(Trigger::new(
        api.clone(),
        remote.clone(),
        piped.clone(),
        notifier.clone(),
        Dir::new(dir.path().join("trigger")),
        trigger::Options::default(),
    ));
    let controller = Arc::new(Controller::new(
        Components {
            api: api.clone(),
            git: remote.clone(),
            registry: Arc::new(Registry::default_registry()),
            log_persister: Arc::new(Persister::new(api.clone(), Default::default())),
            command_store: Arc::new(CommandStore::new(api.clone(), Default::default())),
            notifier,
            piped,
        },
        Dir::new(dir.path().join("deployments")),
        controller::Options::default(),
    ));

    let cancel = CancellationToken::new();
    let trigger_handle = {
        let (trigger, cancel) = (trigger.clone(), cancel.clone());
        tokio::spawn(async move { trigger.run(cancel).await })
    };
    let controller_handle = {
        let (controller, cancel) = (controller.clone(), cancel.clone());
        tokio::spawn(async move { controller.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(180)).await;
    let first = api.deployment_of("app-1").unwrap();
    assert_eq!(first.commit_hash(), "h1");
    assert_eq!(first.status, DeploymentStatus::Success);
    assert_eq!(first.stages[0].status, StageStatus::Success);
    assert!(api
        .log_blocks
        .lock()
        .unwrap()
        .iter()
        .any(|b| b.log == "Waited for 1m0s"));
    assert!(api
        .completed_log_flushes
        .lock()
        .unwrap()
        .contains(&"stage-0".to_string()));

    // Commits that leave the application alone do not deploy it.
    remote.commit(
        "h2",
        &[("apps/demo/app.pipecd.yaml", APP_CONFIG), ("docs/README.md", "hello")],
    );
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(api.deployments.lock().unwrap().len(), 1);

    remote.commit(
        "h3",
        &[
            ("apps/demo/app.pipecd.yaml", APP_CONFIG),
            ("apps/demo/values.yaml", "replicas: 2"),
            ("docs/README.md", "hello"),
        ],
    );
    tokio::time::sleep(Duration::from_secs(300)).await;
    let second = api.deployment_of("app-1").unwrap();
    assert_eq!(second.commit_hash(), "h3");
    assert_eq!(second.status, DeploymentStatus::Success);
    assert_eq!(api.deployments.lock().unwrap().len(), 2);

    cancel.cancel();
    assert_ok!(trigger_handle.await.unwrap());
    assert_ok!(controller_handle.await.unwrap());
    assert!(controller.scheduler_ids().iter().all(|id| id != &first.id));
}
