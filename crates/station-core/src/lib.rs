//! 采集工作站运行时
//!
//! 每个物理设备一个工作任务，通过有界通道向协调器报告状态；
//! 协调器合并状态、写入时序日志并驱动上传队列。

pub mod backoff;
pub mod channel;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod station;
pub mod supervisor;
pub mod uploader;
pub mod worker;

pub use backoff::Backoff;
pub use channel::{bounded, RecordReceiver, RecordSender, RecvError, SendOutcome};
pub use coordinator::{
    Coordinator, CoordinatorHandle, CoordinatorStatus, DeviceEntry, DiskSpace, SnapshotStore, StationMetadata,
    StationSnapshot, TimeSeriesLog,
};
pub use error::{DeviceError, Result, StationError, TransportError};
pub use model::{
    artifact_file_name, Artifact, ArtifactKind, Disposition, Identifier, RecordKind, StatusRecord,
    WorkerConfig, WorkerState,
};
pub use station::{RunningStation, Station, StationBuilder, StationHandle};
pub use station_shutdown::{ShutdownReport, StopReason, StopSignal};
pub use supervisor::{
    ConfigSource, ConfigWatcher, DeviceDescriptor, DriverFactory, FileConfigSource, HardwareProbe, ReconcileReport,
    ResolvedDevices, Supervisor, SupervisorHandle,
};
pub use uploader::{
    DestinationStatus, FallbackTransport, LocalCopyTransport, TaskState, TransferReceipt, Transport,
    TransportConnector, TransportFactory, UploadTask, Uploader, UploaderHandle,
};
pub use worker::{CaptureWindow, DeviceDriver, StopOutcome, UnitOutcome, Worker, WorkerHandle};
