
use station_config::{DestinationConfig, DestinationKind, UploaderConfig};
use station_core::{Artifact, ArtifactKind, TaskState, TransportFactory, Uploader, UploaderHandle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use test_helpers::{scripted_connector, TransferBehavior};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Attempts = Arc<Mutex<Vec<(Instant, PathBuf)>>>;

struct Harness {
    _dir: TempDir,
    file: PathBuf,
    handle: UploaderHandle,
    attempts: Attempts,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Harness {
    /// 一个 SFTP 目标 `nas`，使用脚本化传输
    fn start(behavior: TransferBehavior, settings: UploaderConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cam-A_2024_06_01_10_00_00.jpg");
        std::fs::write(&file, b"jpeg-bytes").unwrap();

        let attempts: Attempts = Arc::new(Mutex::new(Vec::new()));
        let factory = TransportFactory::new()
            .register(DestinationKind::Sftp, scripted_connector(behavior, attempts.clone()));

        let mut uploader = Uploader::new(settings, dir.path().join("archive"), factory);
        uploader.add_destination(DestinationConfig {
            kind: DestinationKind::Sftp,
            host: Some("nas.local".to_string()),
            ..DestinationConfig::local("nas", "/srv/station")
        });
        let handle = uploader.handle();

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(uploader.run(stop_rx));

        Self {
            _dir: dir,
            file,
            handle,
            attempts,
            stop,
            task,
        }
    }

    fn artifact(&self) -> Artifact {
        Artifact::new("cam-A", &self.file, ArtifactKind::Image).with_destinations(vec!["nas".to_string()])
    }

    fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    async fn stop(self) {
        self.stop.send(true).unwrap();
        self.task.await.unwrap();
    }
}

fn settings() -> UploaderConfig {
    UploaderConfig {
        tick_secs: 3600,
        backoff_base_ms: 1_000,
        backoff_cap_ms: 16_000,
        max_attempts: 6,
        ..UploaderConfig::default()
    }
}

fn gaps(times: &[Instant]) -> Vec<Duration> {
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

/// 失败的任务按 1s、2s、4s、8s、16s 退避，第 6 次失败后放弃并保留文件
#[tokio::test(start_paused = true)]
async fn test_failed_transfer_backs_off_then_abandons() {
    let harness = Harness::start(TransferBehavior::Fail, settings());
    assert_eq!(harness.handle.enqueue_artifact(&harness.artifact()), 1);
    harness.handle.trigger_upload("nas").unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;

    let times = harness.attempt_times();
    assert_eq!(times.len(), 6);
    let expected: Vec<Duration> = [1, 2, 4, 8, 16].into_iter().map(Duration::from_secs).collect();
    assert_eq!(gaps(&times), expected);

    let abandoned = harness.handle.abandoned("nas").unwrap();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].state, TaskState::Abandoned);
    assert_eq!(abandoned[0].attempts, 6);
    assert!(abandoned[0].last_error.as_deref().unwrap().contains("550"));
    assert_eq!(harness.handle.pending_count("nas").unwrap(), 0);
    assert!(harness.file.exists());

    let status = &harness.handle.status()[0];
    assert_eq!(status.failed_attempts, 6);
    assert_eq!(status.abandoned, 1);
    assert_eq!(status.files_uploaded, 0);

    harness.stop().await;
}

/// 同一文件入队两次只上传一次
#[tokio::test(start_paused = true)]
async fn test_double_enqueue_uploads_once() {
    let harness = Harness::start(TransferBehavior::Confirm, settings());
    let artifact = harness.artifact().with_disposition(station_core::Disposition::Archive);

    assert_eq!(harness.handle.enqueue_artifact(&artifact), 1);
    assert_eq!(harness.handle.enqueue_artifact(&artifact), 0);
    harness.handle.trigger_upload("nas").unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.attempt_times().len(), 1);
    assert_eq!(harness.handle.status()[0].files_uploaded, 1);

    // 刚确认过的文件再次入队仍是空操作
    assert_eq!(harness.handle.enqueue_artifact(&artifact), 0);
    harness.stop().await;
}

/// 远端确认的字节数不符时视为失败，源文件保留
#[tokio::test(start_paused = true)]
async fn test_short_receipt_keeps_source_file() {
    let harness = Harness::start(
        TransferBehavior::ShortReceipt,
        UploaderConfig {
            max_attempts: 2,
            ..settings()
        },
    );
    harness.handle.enqueue_artifact(&harness.artifact());
    harness.handle.trigger_upload("nas").unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(harness.attempt_times().len(), 2);
    assert_eq!(harness.handle.abandoned("nas").unwrap().len(), 1);
    assert!(harness.file.exists());
    assert_eq!(harness.handle.status()[0].files_uploaded, 0);

    harness.stop().await;
}

/// 无法连接时目标标记为不可用，任务的尝试次数不增加
#[tokio::test(start_paused = true)]
async fn test_unreachable_destination_marked_unavailable() {
    let harness = Harness::start(TransferBehavior::Refuse, settings());
    harness.handle.enqueue_artifact(&harness.artifact());
    harness.handle.trigger_upload("nas").unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let status = &harness.handle.status()[0];
    assert!(!status.available);
    assert!(!status.connected);
    assert!(status.unavailable_until.is_some());
    assert!(status.last_error.as_deref().unwrap().contains("refused"));
    assert_eq!(status.pending, 1);

    let pending = harness.handle.pending("nas").unwrap();
    assert_eq!(pending[0].attempts, 0);
    assert_eq!(pending[0].state, TaskState::Pending);
    assert!(harness.attempt_times().is_empty());
    assert!(harness.file.exists());

    harness.stop().await;
}

/// 放弃的任务可以重新入队，尝试次数从零开始
#[tokio::test(start_paused = true)]
async fn test_requeue_abandoned_retries_from_scratch() {
    let harness = Harness::start(
        TransferBehavior::Fail,
        UploaderConfig {
            max_attempts: 2,
            ..settings()
        },
    );
    harness.handle.enqueue_artifact(&harness.artifact());
    harness.handle.trigger_upload("nas").unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.handle.abandoned("nas").unwrap().len(), 1);

    // 放弃的文件不会被再次自动入队
    assert_eq!(harness.handle.enqueue_artifact(&harness.artifact()), 0);

    assert_eq!(harness.handle.requeue_abandoned("nas").unwrap(), 1);
    assert!(harness.handle.abandoned("nas").unwrap().is_empty());
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(harness.attempt_times().len(), 4);
    let abandoned = harness.handle.abandoned("nas").unwrap();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].attempts, 2);

    harness.stop().await;
}
