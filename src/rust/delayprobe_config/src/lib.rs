//! Configuration for the delayprobe daemon: the `/etc/delayprobe.conf`
//! file, and the flow-probe parameter types shared with the control bus.

mod etc;
mod params;

pub use etc::{
    load_config, Config, ConfigError, ExporterConfig, InterfaceConfig, TableConfig,
    CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH,
};
pub use params::{
    FlowDirection, FlowVariant, ParamsConfig, RecordFlags, DEFAULT_ACTIVE_TIMER,
    DEFAULT_PASSIVE_TIMER,
};
