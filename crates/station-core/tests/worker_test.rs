
use station_config::DeviceKind;
use station_core::{bounded, RecordKind, StopOutcome, Worker, WorkerState};
use std::sync::atomic::Ordering;
use std::time::Duration;
use test_helpers::{device, drain, MockDriver, UnitBehavior};

/// 连续失败达到阈值后进入 Degraded，重新获取的等待时间单调不减且有上限
#[tokio::test(start_paused = true)]
async fn test_failing_unit_degrades_at_threshold_with_capped_backoff() {
    let (sender, mut receiver) = bounded(256, Duration::from_millis(50));
    let driver = MockDriver::new(UnitBehavior::FailAlways);

    let mut config = device("dht", DeviceKind::Sensor);
    config.interval_secs = 10;
    config.error_threshold = 3;
    config.backoff_base_ms = 1_000;
    config.backoff_cap_ms = 4_000;

    let handle = Worker::new(driver.clone(), sender).start(config).unwrap();
    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(handle.stop().await, StopOutcome::Graceful);

    let records = drain(&mut receiver);
    let failures: Vec<_> = records
        .iter()
        .filter(|r| r.kind == RecordKind::Failure)
        .collect();

    // 前两次失败仍为 Running，第三次进入 Degraded
    assert_eq!(failures[0].state, WorkerState::Running);
    assert_eq!(failures[0].consecutive_errors, 1);
    assert_eq!(failures[1].state, WorkerState::Running);
    assert_eq!(failures[2].state, WorkerState::Degraded);
    assert_eq!(failures[2].consecutive_errors, 3);

    // 每个获取周期恰好执行阈值次操作
    let acquisitions = driver.acquisitions();
    let units = driver.units();
    assert!(acquisitions.len() >= 4);
    for (i, window) in acquisitions.windows(2).enumerate() {
        let in_cycle = units
            .iter()
            .filter(|t| **t >= window[0] && **t < window[1])
            .count();
        assert_eq!(in_cycle, 3, "cycle {i}");
    }

    // 从最后一次失败到重新获取的等待：1s、2s、4s、4s…
    let delays: Vec<Duration> = acquisitions
        .iter()
        .skip(1)
        .map(|acquired| {
            let last_failure = units.iter().filter(|t| *t < acquired).max().unwrap();
            *acquired - *last_failure
        })
        .collect();
    let expected = [1u64, 2, 4, 4];
    for (delay, secs) in delays.iter().zip(expected) {
        assert_eq!(*delay, Duration::from_secs(secs));
    }
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(4)));

    // 每次获取的设备都恰好释放一次
    assert_eq!(driver.releases.load(Ordering::SeqCst) as usize, acquisitions.len());
}

/// 每次成功操作恰好一条记录，序号连续
#[tokio::test(start_paused = true)]
async fn test_successful_units_emit_one_record_each() {
    let (sender, mut receiver) = bounded(256, Duration::from_millis(50));
    let driver = MockDriver::new(UnitBehavior::Succeed);

    let mut config = device("light", DeviceKind::Light);
    config.interval_secs = 5;

    let handle = Worker::new(driver.clone(), sender).start(config).unwrap();
    tokio::time::sleep(Duration::from_secs(22)).await;
    assert_eq!(handle.state(), WorkerState::Running);
    handle.stop().await;

    let records = drain(&mut receiver);
    let observations = records
        .iter()
        .filter(|r| r.kind == RecordKind::Observation)
        .count();
    assert_eq!(observations, driver.units().len());
    assert_eq!(observations, 5);

    let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, (1..=records.len() as u64).collect::<Vec<_>>());

    let last = records.last().unwrap();
    assert_eq!(last.kind, RecordKind::Final);
    assert_eq!(last.state, WorkerState::Stopped);
}

/// 图像设备的产物带上配置的上传目标
#[tokio::test(start_paused = true)]
async fn test_capture_emits_artifact_with_destinations() {
    let dir = tempfile::tempdir().unwrap();
    let (sender, mut receiver) = bounded(64, Duration::from_millis(50));
    let driver = MockDriver::new(UnitBehavior::Capture);

    let mut config = device("cam-A", DeviceKind::UsbCamera);
    config.output_dir = Some(dir.path().join("cam-A"));
    config.upload = vec!["nas".to_string()];

    let handle = Worker::new(driver, sender).start(config).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.stop().await;

    let artifact = drain(&mut receiver)
        .into_iter()
        .find_map(|r| r.artifact)
        .unwrap();
    assert_eq!(artifact.identifier, "cam-A");
    assert_eq!(artifact.destinations, vec!["nas".to_string()]);
    assert!(artifact.path.exists());
}

/// 操作不响应停止请求时，超时后强制停止并发出带 `forced` 标记的最终记录
#[tokio::test(start_paused = true)]
async fn test_unresponsive_unit_is_forced_to_stop() {
    let (sender, mut receiver) = bounded(64, Duration::from_millis(50));
    let driver = MockDriver::new(UnitBehavior::Hang);

    let mut config = device("cam-stuck", DeviceKind::Dslr);
    config.unit_timeout_secs = 600;
    config.stop_timeout_secs = 2;

    let handle = Worker::new(driver.clone(), sender).start(config).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(driver.units().len(), 1);

    let started = tokio::time::Instant::now();
    assert_eq!(handle.stop().await, StopOutcome::Forced);
    assert_eq!(started.elapsed(), Duration::from_secs(2));

    let last = drain(&mut receiver).pop().unwrap();
    assert_eq!(last.kind, RecordKind::Final);
    assert_eq!(last.state, WorkerState::Stopped);
    assert_eq!(last.attributes.get("forced"), Some(&serde_json::Value::Bool(true)));
}
