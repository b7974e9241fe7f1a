pub mod destination;
pub mod device;
pub mod global;
pub mod loader;

pub use destination::{DestinationConfig, DestinationKind};
pub use device::{
    validate_identifier, CaptureWindow, DeviceConfig, DeviceConfigError, DeviceKind, MAX_INTERVAL_SECS,
    RESERVED_IDENTIFIER,
};
pub use global::{
    ChannelConfig, CoordinatorConfig, LoggingConfig, StationConfig, StationSection,
    SupervisorConfig, UploaderConfig,
};
pub use loader::{ConfigLoader, ResolvedDevices};
