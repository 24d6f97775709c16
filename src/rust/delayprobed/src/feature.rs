//! The control plane. Every change to the probe's configuration goes
//! through [`FeatureController`], one request at a time.

use crate::context::{FlowParams, InterfaceFeature, ProbeContext, TrackingMode};
use crate::flow_table::FlowEntry;
use crate::ipfix::parse_template;
use crate::scheduler::SchedulerMessage;
use delayprobe_bus::{FlowEntrySummary, InterfaceDetail, TableStatistics};
use delayprobe_config::{
    FlowDirection, FlowVariant, RecordFlags, DEFAULT_ACTIVE_TIMER, DEFAULT_PASSIVE_TIMER,
};
use delayprobe_utils::unix_time::boot_time_nanos;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureError {
    #[error("Flow probe parameters must be set before enabling an interface")]
    NotConfigured,
    #[error("Interface already uses a different flow variant")]
    DifferentVariant,
    #[error("Feature already enabled on this interface")]
    AlreadyEnabled,
    #[error("Feature is not enabled on this interface")]
    NotEnabled,
    #[error("Invalid parameter value")]
    InvalidValue,
    #[error("Interface index out of range")]
    InvalidInterface,
    #[error("Not supported while the probe is in use")]
    Unsupported,
}

pub struct FeatureController {
    ctx: Arc<ProbeContext>,
    lock: Mutex<()>,
}

impl FeatureController {
    pub fn new(ctx: Arc<ProbeContext>) -> Self {
        Self {
            ctx,
            lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &Arc<ProbeContext> {
        &self.ctx
    }

    fn now_ns() -> u64 {
        boot_time_nanos().unwrap_or(0)
    }

    /// Sets the global parameters. `None` timers take the defaults; a zero
    /// active timer selects stateless export.
    pub fn set_params(
        &self,
        record: RecordFlags,
        active_timer: Option<u32>,
        passive_timer: Option<u32>,
    ) -> Result<FlowParams, FeatureError> {
        let _guard = self.lock.lock();
        let params = FlowParams {
            record,
            active_timer: active_timer.unwrap_or(DEFAULT_ACTIVE_TIMER),
            passive_timer: passive_timer.unwrap_or(DEFAULT_PASSIVE_TIMER),
        };
        self.check_params(&params).inspect_err(|e| {
            warn!("Rejected flow probe parameters {params:?}: {e}");
        })?;
        *self.ctx.params.write() = Some(params);
        info!(
            "Flow probe parameters: record {}, active {}s, passive {}s",
            params.record, params.active_timer, params.passive_timer
        );
        Ok(params)
    }

    fn check_params(&self, params: &FlowParams) -> Result<(), FeatureError> {
        if params.record != RecordFlags::L3 {
            return Err(FeatureError::InvalidValue);
        }
        if params.passive_timer > 0 && params.active_timer > params.passive_timer {
            return Err(FeatureError::InvalidValue);
        }
        if self.ctx.interfaces.read().iter().any(Option::is_some) {
            return Err(FeatureError::Unsupported);
        }
        // Worker state is allocated once; its kind cannot change.
        match (self.ctx.mode(), params.is_stateful()) {
            (TrackingMode::Stateful, false) | (TrackingMode::Stateless, true) => {
                Err(FeatureError::Unsupported)
            }
            _ => Ok(()),
        }
    }

    /// The current parameters, or the defaults with no record flags if
    /// none were ever set.
    pub fn get_params(&self) -> FlowParams {
        self.ctx.params().unwrap_or(FlowParams::UNSET)
    }

    /// Enables or disables flow tracking on an interface.
    pub fn interface_add_del(
        &self,
        sw_if_index: u32,
        variant: FlowVariant,
        direction: FlowDirection,
        is_add: bool,
    ) -> Result<(), FeatureError> {
        let _guard = self.lock.lock();
        self.check_interface(sw_if_index, variant, is_add)
            .inspect_err(|e| {
                let action = if is_add { "enable" } else { "disable" };
                warn!("Cannot {action} {variant} on interface {sw_if_index}: {e}");
            })?;
        if is_add {
            self.enable(sw_if_index, InterfaceFeature { variant, direction });
        } else {
            self.disable(sw_if_index, variant);
        }
        Ok(())
    }

    fn check_interface(
        &self,
        sw_if_index: u32,
        variant: FlowVariant,
        is_add: bool,
    ) -> Result<(), FeatureError> {
        if self.ctx.params().is_none() {
            return Err(FeatureError::NotConfigured);
        }
        if sw_if_index >= self.ctx.settings.max_interfaces {
            return Err(FeatureError::InvalidInterface);
        }
        match (self.ctx.interface_feature(sw_if_index), is_add) {
            (Some(current), true) if current.variant == variant => {
                Err(FeatureError::AlreadyEnabled)
            }
            (Some(current), _) if current.variant != variant => {
                Err(FeatureError::DifferentVariant)
            }
            (None, false) => Err(FeatureError::NotEnabled),
            _ => Ok(()),
        }
    }

    fn enable(&self, sw_if_index: u32, feature: InterfaceFeature) {
        let now = Self::now_ns();
        if self.ctx.mode() == TrackingMode::Uninitialized {
            self.initialize_workers(now);
        }

        let mut templates = self.ctx.templates.write();
        if let Some(template) = templates.register(feature.variant, self.ctx.exporter.transport(), now)
        {
            info!(
                "Registered {} template {}",
                feature.variant, template.template_id
            );
            match parse_template(&template.frame) {
                Ok(parsed) => debug!("Template {}: {:?}", parsed.template_id, parsed.fields),
                Err(e) => warn!("Template {} does not parse: {e}", template.template_id),
            }
            self.ctx.exporter.send_template(template);
        }
        drop(templates);

        if let Some(slot) = self.ctx.interfaces.write().get_mut(sw_if_index as usize) {
            *slot = Some(feature);
        }
        info!(
            "Enabled {} ({}) on interface {sw_if_index}",
            feature.variant, feature.direction
        );
    }

    fn initialize_workers(&self, now_ns: u64) {
        let stateful = self.ctx.params().is_some_and(|p| p.is_stateful());
        let mode = if stateful {
            TrackingMode::Stateful
        } else {
            TrackingMode::Stateless
        };
        for worker in self.ctx.workers.iter() {
            worker
                .state
                .lock()
                .initialize(mode, self.ctx.settings.log2_size, now_ns);
        }
        *self.ctx.mode.write() = mode;
        info!(
            "Initialized {} workers ({mode:?}, {} entries each)",
            self.ctx.workers.len(),
            if stateful { 1usize << self.ctx.settings.log2_size } else { 0 }
        );
        if self.ctx.scheduler.send(SchedulerMessage::Activate).is_err() {
            warn!("Export scheduler is not running");
        }
    }

    fn disable(&self, sw_if_index: u32, variant: FlowVariant) {
        if let Some(slot) = self.ctx.interfaces.write().get_mut(sw_if_index as usize) {
            *slot = None;
        }
        let removed = self.ctx.templates.write().deregister(variant);
        if let Some(registration) = removed {
            for worker in self.ctx.workers.iter() {
                worker.state.lock().flush_variant(variant, &self.ctx);
            }
            info!(
                "Deregistered {variant} template {}",
                registration.template.template_id
            );
        }
        info!("Disabled {variant} on interface {sw_if_index}");
    }

    /// Interfaces with the feature enabled, or just `sw_if_index`.
    pub fn dump_interfaces(&self, sw_if_index: Option<u32>) -> Vec<InterfaceDetail> {
        self.ctx
            .interfaces
            .read()
            .iter()
            .enumerate()
            .filter(|(index, _)| sw_if_index.map_or(true, |wanted| *index as u32 == wanted))
            .filter_map(|(index, slot)| {
                slot.map(|feature| InterfaceDetail {
                    sw_if_index: index as u32,
                    which: feature.variant,
                    direction: feature.direction,
                })
            })
            .collect()
    }

    /// Every live entry on every worker.
    pub fn show_table(&self) -> Vec<FlowEntrySummary> {
        let now = Self::now_ns();
        self.ctx
            .workers
            .iter()
            .flat_map(|worker| worker.state.lock().summaries(now))
            .collect()
    }

    pub fn show_statistics(&self) -> TableStatistics {
        let mode = self.ctx.mode();
        let stateful = mode == TrackingMode::Stateful;
        TableStatistics {
            initialized: mode != TrackingMode::Uninitialized,
            stateful,
            entry_size_bytes: std::mem::size_of::<FlowEntry>(),
            pool_capacity: if stateful {
                1 << self.ctx.settings.log2_size
            } else {
                0
            },
            workers: self.ctx.workers.iter().map(|w| w.statistics()).collect(),
        }
    }
}
