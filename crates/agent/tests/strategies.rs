//! Isolated execution strategies
//!
//! These need a docker daemon or root with a prepared build user, so they
//! are ignored by default. Run them with `--ignored` on a suitable host.

#![cfg(unix)]

mod common;

use buildq_agent::strategy::{ContainerStrategy, ExecutionStrategy, SuStrategy};
use buildq_agent::{Limits, OutputSink};
use buildq_common::config::{DockerConfig, SuConfig};
use buildq_common::Instructions;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Collect(Mutex<Vec<u8>>);

impl Collect {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl OutputSink for Collect {
    fn write(&self, data: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(data);
    }
}

fn limits() -> Limits {
    Limits {
        timeout: Duration::from_secs(120),
        iotimeout: Duration::from_secs(60),
    }
}

fn stage(script: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("build_script.sh"), script).unwrap();
    dir
}

#[tokio::test]
#[ignore = "requires a docker daemon and the ubuntu:22.04 image"]
async fn test_docker_strategy_runs_script_in_container() {
    common::init_test_tracing();
    let strategy = ContainerStrategy::new(&DockerConfig {
        image: "ubuntu:22.04".into(),
        allow_user_images: false,
    })
    .await
    .unwrap();

    let dir = stage("echo inside-container; test -f /.dockerenv; exit 12\n");
    let sink = Collect::default();
    let exit_code = strategy
        .run(
            &common::job("docker-1", Instructions::default()),
            &dir.path().join("build_script.sh"),
            &sink,
            limits(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(exit_code, 12);
    assert!(sink.text().contains("inside-container"));
}

#[tokio::test]
#[ignore = "requires root, a 'buildq' user and /opt/buildq install"]
async fn test_su_strategy_runs_as_build_user() {
    common::init_test_tracing();
    let strategy = SuStrategy::new(&SuConfig::default()).await.unwrap();

    let dir = stage("id -un\n");
    let sink = Collect::default();
    let exit_code = strategy
        .run(
            &common::job("su-1", Instructions::default()),
            &dir.path().join("build_script.sh"),
            &sink,
            limits(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(exit_code, 0);
    assert!(sink.text().contains("buildq"));
}
