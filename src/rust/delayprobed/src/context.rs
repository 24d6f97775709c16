//! State shared by the control plane, the workers and the scheduler.
//!
//! Built once at startup and passed around as `Arc<ProbeContext>`. Only
//! the [`FeatureController`](crate::FeatureController) writes to it.

use crate::exporter::Exporter;
use crate::flow_table::FlowKey;
use crate::ipfix::{build_template, Template, Transport};
use crate::packet::PacketMeta;
use crate::scheduler::SchedulerMessage;
use crate::worker::WorkerHandle;
use crossbeam_channel::Sender;
use delayprobe_config::{
    Config, FlowDirection, FlowVariant, RecordFlags, DEFAULT_ACTIVE_TIMER, DEFAULT_PASSIVE_TIMER,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// First template id handed out. Lower ids are reserved by IPFIX.
pub const FIRST_TEMPLATE_ID: u16 = 256;

/// Data frames older than this are sent at the next interrupt.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Sizing fixed at startup.
#[derive(Clone, Debug)]
pub struct ProbeSettings {
    pub workers: usize,
    pub log2_size: u8,
    pub max_interfaces: u32,
    pub template_interval: Duration,
    pub flush_interval: Duration,
}

impl From<&Config> for ProbeSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            log2_size: config.table.log2_size,
            max_interfaces: config.table.max_interfaces,
            template_interval: Duration::from_secs(config.exporter.template_interval_seconds),
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

/// The global probe parameters, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowParams {
    pub record: RecordFlags,
    pub active_timer: u32,
    pub passive_timer: u32,
}

impl FlowParams {
    /// What `get_params` reports before anything is configured.
    pub const UNSET: FlowParams = FlowParams {
        record: RecordFlags::empty(),
        active_timer: DEFAULT_ACTIVE_TIMER,
        passive_timer: DEFAULT_PASSIVE_TIMER,
    };

    /// An active timer of zero disables per-flow state.
    pub fn is_stateful(&self) -> bool {
        self.active_timer > 0
    }

    pub fn active(&self) -> Duration {
        Duration::from_secs(u64::from(self.active_timer))
    }

    pub fn passive(&self) -> Duration {
        Duration::from_secs(u64::from(self.passive_timer))
    }
}

/// The feature setting of one interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceFeature {
    pub variant: FlowVariant,
    pub direction: FlowDirection,
}

/// How the workers were initialized. Fixed by the first enable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingMode {
    Uninitialized,
    Stateful,
    Stateless,
}

pub struct TemplateRegistration {
    pub template: Template,
    /// Interfaces using this variant
    pub interfaces: usize,
    pub last_sent_ns: u64,
}

/// Reference-counted templates, one slot per variant.
pub struct TemplateRegistry {
    slots: Vec<Option<TemplateRegistration>>,
    next_id: u16,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..FlowVariant::COUNT).map(|_| None).collect(),
            next_id: FIRST_TEMPLATE_ID,
        }
    }

    pub fn get(&self, variant: FlowVariant) -> Option<&TemplateRegistration> {
        self.slots[variant.index()].as_ref()
    }

    /// Template id and record length of a registered variant.
    pub fn export_layout(&self, variant: FlowVariant) -> Option<(u16, usize)> {
        self.get(variant)
            .map(|r| (r.template.template_id, r.template.record_len))
    }

    /// Adds one user of `variant`. Returns the new template when this is
    /// the first user, so that the caller can send it.
    pub fn register(
        &mut self,
        variant: FlowVariant,
        transport: &Transport,
        now_ns: u64,
    ) -> Option<&Template> {
        let slot = &mut self.slots[variant.index()];
        if let Some(registration) = slot {
            registration.interfaces += 1;
            return None;
        }
        let template_id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(FIRST_TEMPLATE_ID);
        let registration = slot.insert(TemplateRegistration {
            template: build_template(variant, transport, template_id),
            interfaces: 1,
            last_sent_ns: now_ns,
        });
        Some(&registration.template)
    }

    /// Drops one user of `variant`. Returns the registration if that was
    /// the last one.
    pub fn deregister(&mut self, variant: FlowVariant) -> Option<TemplateRegistration> {
        let slot = &mut self.slots[variant.index()];
        let registration = slot.as_mut()?;
        registration.interfaces = registration.interfaces.saturating_sub(1);
        if registration.interfaces == 0 {
            slot.take()
        } else {
            None
        }
    }

    /// Templates whose refresh interval has passed. Marks them sent.
    pub fn take_due(&mut self, now_ns: u64, interval: Duration) -> Vec<Template> {
        let interval_ns = interval.as_nanos() as u64;
        self.slots
            .iter_mut()
            .flatten()
            .filter(|r| now_ns.saturating_sub(r.last_sent_ns) >= interval_ns)
            .map(|r| {
                r.last_sent_ns = now_ns;
                r.template.clone()
            })
            .collect()
    }
}

pub struct ProbeContext {
    pub settings: ProbeSettings,
    pub(crate) params: RwLock<Option<FlowParams>>,
    pub(crate) interfaces: RwLock<Vec<Option<InterfaceFeature>>>,
    pub(crate) templates: RwLock<TemplateRegistry>,
    pub(crate) mode: RwLock<TrackingMode>,
    pub exporter: Arc<Exporter>,
    pub workers: Vec<WorkerHandle>,
    pub(crate) scheduler: Sender<SchedulerMessage>,
}

impl ProbeContext {
    /// Builds the context with one unstarted handle per worker.
    pub fn new(
        settings: ProbeSettings,
        exporter: Arc<Exporter>,
        scheduler: Sender<SchedulerMessage>,
    ) -> Self {
        let workers = (0..settings.workers).map(WorkerHandle::new).collect();
        let interfaces = vec![None; settings.max_interfaces as usize];
        Self {
            settings,
            params: RwLock::new(None),
            interfaces: RwLock::new(interfaces),
            templates: RwLock::new(TemplateRegistry::new()),
            mode: RwLock::new(TrackingMode::Uninitialized),
            exporter,
            workers,
            scheduler,
        }
    }

    pub fn params(&self) -> Option<FlowParams> {
        *self.params.read()
    }

    pub fn mode(&self) -> TrackingMode {
        *self.mode.read()
    }

    pub fn interface_feature(&self, sw_if_index: u32) -> Option<InterfaceFeature> {
        self.interfaces
            .read()
            .get(sw_if_index as usize)
            .copied()
            .flatten()
    }

    /// The worker that owns packets with `key`.
    pub fn worker_for(&self, key: &FlowKey) -> usize {
        // The table buckets use the low bits of the same hash.
        ((key.bucket_hash() >> 32) % self.workers.len() as u64) as usize
    }

    /// Splits a batch by owning worker and queues each part. Returns the
    /// number of packets dropped because a worker's queue was full.
    pub fn dispatch(&self, packets: Vec<PacketMeta>) -> usize {
        let mut batches: Vec<Vec<PacketMeta>> = vec![Vec::new(); self.workers.len()];
        for packet in packets {
            let worker = self.worker_for(&FlowKey::from_packet(&packet));
            batches[worker].push(packet);
        }
        let mut dropped = 0;
        for (worker, batch) in self.workers.iter().zip(batches) {
            let len = batch.len();
            if len > 0 && !worker.submit(batch) {
                dropped += len;
            }
        }
        dropped
    }

    /// Any worker with expirations waiting to be drained?
    pub fn has_backlog(&self) -> bool {
        self.workers.iter().any(|w| w.backlog() > 0)
    }

    /// Resends templates whose refresh interval has passed.
    pub fn refresh_templates(&self, now_ns: u64) {
        let due = self
            .templates
            .write()
            .take_due(now_ns, self.settings.template_interval);
        for template in due {
            debug!("Refreshing template {}", template.template_id);
            self.exporter.send_template(&template);
        }
    }
}
