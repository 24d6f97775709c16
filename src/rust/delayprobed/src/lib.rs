//! Flow probe core: per-worker flow tables aged by timer wheels, and
//! IPFIX export of SRv6 flow records.
//!
//! A [`ProbeRuntime`] owns the worker threads and the export scheduler.
//! Packets enter through [`ProbeContext::dispatch`]; configuration goes
//! through the [`FeatureController`].

#![deny(clippy::unwrap_used)]

mod context;
mod control;
mod exporter;
mod feature;
pub mod flow_table;
pub mod ipfix;
mod packet;
mod scheduler;
pub mod timer_wheel;
mod worker;

pub use context::{
    FlowParams, InterfaceFeature, ProbeContext, ProbeSettings, TemplateRegistration,
    TemplateRegistry, TrackingMode, FIRST_TEMPLATE_ID, FLUSH_INTERVAL,
};
pub use control::{apply_startup_config, handle_bus_requests};
pub use exporter::{DataFrame, ExportError, Exporter, FrameSink, UdpCollector};
pub use feature::{FeatureController, FeatureError};
pub use packet::{PacketMeta, SrhInfo, SRH_MAX_SID_LIST};
pub use scheduler::{SchedulerMessage, BACKLOG_SLEEP, IDLE_SLEEP};
pub use worker::{WorkerHandle, WorkerSignal, WorkerState, INGRESS_QUEUE_DEPTH};

use anyhow::Result;
use crossbeam_channel::{unbounded, Sender};
use delayprobe_config::Config;
use ipfix::Transport;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// The running probe: worker threads, the scheduler thread and the
/// controller in front of them.
pub struct ProbeRuntime {
    controller: Arc<FeatureController>,
    scheduler: Sender<SchedulerMessage>,
    threads: Vec<JoinHandle<()>>,
}

impl ProbeRuntime {
    /// Builds the context, starts every thread, then applies the startup
    /// parameters and interfaces from `config`.
    pub fn start(config: &Config, sink: Arc<dyn FrameSink>) -> Result<Self> {
        let settings = ProbeSettings::from(config);
        let exporter = Arc::new(Exporter::new(
            sink,
            Transport::from(&config.exporter),
            usize::from(config.exporter.path_mtu),
        ));
        let (scheduler_tx, scheduler_rx) = unbounded();
        let ctx = Arc::new(ProbeContext::new(settings, exporter, scheduler_tx.clone()));

        let mut threads = Vec::with_capacity(ctx.workers.len() + 1);
        for id in 0..ctx.workers.len() {
            threads.push(worker::spawn_worker(ctx.clone(), id)?);
        }
        threads.push(scheduler::spawn_scheduler(ctx.clone(), scheduler_rx)?);
        info!("Started {} flow workers", ctx.workers.len());

        let runtime = Self {
            controller: Arc::new(FeatureController::new(ctx)),
            scheduler: scheduler_tx,
            threads,
        };
        apply_startup_config(&runtime.controller, config)?;
        Ok(runtime)
    }

    pub fn controller(&self) -> Arc<FeatureController> {
        self.controller.clone()
    }

    pub fn context(&self) -> &Arc<ProbeContext> {
        self.controller.context()
    }

    /// Stops the scheduler, has every worker export what it holds, and
    /// waits for all threads.
    pub fn shutdown(self) {
        if self.scheduler.send(SchedulerMessage::Shutdown).is_err() {
            warn!("Export scheduler already stopped");
        }
        for worker in self.context().workers.iter() {
            worker.shutdown();
        }
        for thread in self.threads {
            if thread.join().is_err() {
                warn!("A probe thread panicked");
            }
        }
        info!("Flow probe stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exporter::capture::CaptureSink;
    use crate::ipfix::{decode_srh_record, parse_message, parse_template};
    use crate::packet::test_packets::srv6_packet;

    #[test]
    fn runtime_exports_on_shutdown() {
        let config =
            Config::load_from_string(include_str!("../../../../delayprobe.example.toml")).unwrap();
        let sink = Arc::new(CaptureSink::default());
        let runtime = ProbeRuntime::start(&config, sink.clone()).unwrap();
        assert_eq!(runtime.context().workers.len(), 2);
        assert_eq!(runtime.controller().dump_interfaces(None).len(), 1);

        let packets = vec![
            srv6_packet("2001:db8::1", "2001:db8::2", 100),
            srv6_packet("2001:db8::1", "2001:db8::2", 200),
        ];
        assert_eq!(runtime.context().dispatch(packets), 0);
        runtime.shutdown();

        let frames = sink.take();
        let template = parse_template(&frames[0]).unwrap();
        let data: Vec<_> = frames
            .iter()
            .filter_map(|frame| parse_message(frame).ok())
            .flat_map(|message| message.sets)
            .filter(|set| set.set_id == template.template_id)
            .collect();
        assert_eq!(data.len(), 1);
        let record = decode_srh_record(data[0].body).unwrap();
        assert_eq!(record.packets, 2);
        assert_eq!(record.octets, 300);
    }
}
