//! Per-worker flow tracking.
//!
//! Every worker owns one flow table and one timer wheel. Packets for a
//! given key always land on the same worker, so entries never migrate.
//! The worker thread takes its state lock once per batch or interrupt;
//! the control plane takes it only to initialize, flush and report.

use crate::context::{InterfaceFeature, ProbeContext, TrackingMode};
use crate::exporter::DataFrame;
use crate::flow_table::{EntryIndex, FlowEntry, FlowKey, FlowTable, FlowTableError};
use crate::packet::PacketMeta;
use crate::timer_wheel::{Expiration, TimerKind, TimerWheel, MAX_EXPIRATIONS};
use anyhow::Result;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use delayprobe_bus::{FlowEntrySummary, WorkerStatistics};
use delayprobe_config::FlowVariant;
use delayprobe_utils::unix_time::boot_time_nanos;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Batches queued per worker before the producer starts dropping.
pub const INGRESS_QUEUE_DEPTH: usize = 64;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Wakes a worker outside of packet processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Advance timers and send aged frames
    Interrupt,
    /// Send everything pending and exit
    Shutdown,
}

enum Tracking {
    Uninitialized,
    Stateful { table: FlowTable, wheel: TimerWheel },
    Stateless,
}

/// The data frame being filled for each variant.
struct FrameSet {
    frames: Vec<Option<DataFrame>>,
    records_exported: u64,
    frames_sent: u64,
}

impl FrameSet {
    fn new() -> Self {
        Self {
            frames: (0..FlowVariant::COUNT).map(|_| None).collect(),
            records_exported: 0,
            frames_sent: 0,
        }
    }

    fn send(&mut self, frame: DataFrame, ctx: &ProbeContext) {
        ctx.exporter.send_data(frame);
        self.frames_sent += 1;
    }

    /// Appends a record for `entry`, sending the current frame first if
    /// the record would not fit. Records for a variant with no template
    /// are dropped.
    fn append(&mut self, entry: &FlowEntry, now_ns: u64, ctx: &ProbeContext) {
        let Some((template_id, record_len)) = ctx.templates.read().export_layout(entry.variant)
        else {
            debug!("No template for {}; record dropped", entry.variant);
            return;
        };
        let mtu = ctx.exporter.path_mtu();
        let index = entry.variant.index();
        if self.frames[index]
            .as_ref()
            .is_some_and(|f| !f.has_room(record_len, mtu))
        {
            if let Some(full) = self.frames[index].take() {
                self.send(full, ctx);
            }
        }
        self.frames[index]
            .get_or_insert_with(|| {
                DataFrame::new(ctx.exporter.transport(), template_id, mtu, now_ns)
            })
            .push(entry);
        self.records_exported += 1;
    }

    fn flush_aged(&mut self, now_ns: u64, ctx: &ProbeContext) {
        let max_age = ctx.settings.flush_interval.as_nanos() as u64;
        for index in 0..self.frames.len() {
            if self.frames[index]
                .as_ref()
                .is_some_and(|f| now_ns.saturating_sub(f.opened_ns()) >= max_age)
            {
                if let Some(frame) = self.frames[index].take() {
                    self.send(frame, ctx);
                }
            }
        }
    }

    fn flush_variant(&mut self, variant: FlowVariant, ctx: &ProbeContext) {
        if let Some(frame) = self.frames[variant.index()].take() {
            self.send(frame, ctx);
        }
    }

    fn flush_all(&mut self, ctx: &ProbeContext) {
        for variant in FlowVariant::ALL {
            self.flush_variant(variant, ctx);
        }
    }

    fn pending_records(&self) -> u32 {
        self.frames.iter().flatten().map(|f| f.records()).sum()
    }
}

/// Everything one worker owns.
pub struct WorkerState {
    id: usize,
    tracking: Tracking,
    frames: FrameSet,
    expired_tx: Sender<Expiration>,
    expired_rx: Receiver<Expiration>,
    table_full_drops: u64,
}

impl WorkerState {
    pub fn new(id: usize, expired_tx: Sender<Expiration>, expired_rx: Receiver<Expiration>) -> Self {
        Self {
            id,
            tracking: Tracking::Uninitialized,
            frames: FrameSet::new(),
            expired_tx,
            expired_rx,
            table_full_drops: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self.tracking, Tracking::Uninitialized)
    }

    /// Allocates the table and wheel, or switches to stateless export.
    /// Does nothing if already initialized.
    pub fn initialize(&mut self, mode: TrackingMode, log2_size: u8, now_ns: u64) {
        if self.is_initialized() {
            return;
        }
        self.tracking = match mode {
            TrackingMode::Stateful => Tracking::Stateful {
                table: FlowTable::new(log2_size),
                wheel: TimerWheel::new(now_ns, self.expired_tx.clone()),
            },
            TrackingMode::Stateless => Tracking::Stateless,
            TrackingMode::Uninitialized => Tracking::Uninitialized,
        };
    }

    /// Counts one packet against its flow, if its interface has the
    /// feature enabled in the packet's direction.
    pub fn process_packet(&mut self, packet: &PacketMeta, now_ns: u64, ctx: &ProbeContext) {
        let Some(InterfaceFeature { variant, direction }) =
            ctx.interface_feature(packet.observed_sw_if_index())
        else {
            return;
        };
        if !direction.covers(packet.direction) {
            return;
        }
        let Some(params) = ctx.params() else {
            return;
        };

        match &mut self.tracking {
            Tracking::Uninitialized => {}
            Tracking::Stateless => {
                let mut entry = FlowEntry::new(FlowKey::from_packet(packet), variant, now_ns);
                entry.update(packet.length, now_ns);
                self.frames.append(&entry, now_ns, ctx);
            }
            Tracking::Stateful { table, wheel } => {
                let key = FlowKey::from_packet(packet);
                let (index, created) = match table.lookup_or_create(key, variant, now_ns) {
                    Ok(found) => found,
                    Err(FlowTableError::TableFull) => {
                        self.table_full_drops += 1;
                        debug!("Worker {} flow table full; packet not tracked", self.id);
                        return;
                    }
                };
                let Some(entry) = table.get_mut(index) else {
                    return;
                };
                if created {
                    entry.active_timer = Some(wheel.start(index, TimerKind::Active, params.active()));
                    if params.passive_timer > 0 {
                        entry.passive_timer =
                            Some(wheel.start(index, TimerKind::Passive, params.passive()));
                    }
                }
                entry.update(packet.length, now_ns);
            }
        }
    }

    /// Advances the timer wheel, drains expirations and sends aged
    /// frames. Returns the number of expirations handled.
    pub fn handle_interrupt(&mut self, now_ns: u64, ctx: &ProbeContext) -> usize {
        let mut handled = 0;
        if let Tracking::Stateful { table, wheel } = &mut self.tracking {
            wheel.advance(now_ns);
            let params = ctx.params();
            while let Ok(expiration) = self.expired_rx.try_recv() {
                let Some(params) = params else {
                    continue;
                };
                handled += 1;
                expire(
                    table,
                    wheel,
                    &mut self.frames,
                    expiration,
                    params.active(),
                    params.passive(),
                    now_ns,
                    ctx,
                );
            }
        }
        self.frames.flush_aged(now_ns, ctx);
        handled
    }

    pub fn flush_variant(&mut self, variant: FlowVariant, ctx: &ProbeContext) {
        self.frames.flush_variant(variant, ctx);
    }

    pub fn flush_all(&mut self, ctx: &ProbeContext) {
        self.frames.flush_all(ctx);
    }

    /// Exports every entry with unreported packets, then sends all
    /// pending frames. Entries stay in the table.
    pub fn export_and_flush(&mut self, now_ns: u64, ctx: &ProbeContext) {
        if let Tracking::Stateful { table, .. } = &mut self.tracking {
            let pending: Vec<EntryIndex> = table
                .iter()
                .filter(|(_, entry)| entry.packets > 0)
                .map(|(index, _)| index)
                .collect();
            for index in pending {
                if let Some(entry) = table.get_mut(index) {
                    self.frames.append(entry, now_ns, ctx);
                    entry.reset_counters(now_ns);
                }
            }
        }
        self.frames.flush_all(ctx);
    }

    pub fn table(&self) -> Option<&FlowTable> {
        match &self.tracking {
            Tracking::Stateful { table, .. } => Some(table),
            _ => None,
        }
    }

    pub fn summaries(&self, now_ns: u64) -> Vec<FlowEntrySummary> {
        let Some(table) = self.table() else {
            return Vec::new();
        };
        table
            .iter()
            .map(|(index, entry)| FlowEntrySummary {
                worker: self.id,
                index,
                which: entry.variant,
                direction: entry.key.direction,
                rx_sw_if_index: entry.key.rx_sw_if_index,
                tx_sw_if_index: entry.key.tx_sw_if_index,
                src_mac: entry.key.src_mac,
                dst_mac: entry.key.dst_mac,
                src_address: entry.key.src_address,
                dst_address: entry.key.dst_address,
                protocol: entry.key.protocol,
                src_port: entry.key.src_port,
                dst_port: entry.key.dst_port,
                sr_source: entry.key.srh.sr_source,
                active_segment: entry.key.srh.active_segment,
                segments_left: entry.key.srh.segments_left,
                packets: entry.packets,
                octets: entry.octets,
                age_seconds: now_ns.saturating_sub(entry.created_ns) / NANOS_PER_SECOND,
                idle_seconds: now_ns.saturating_sub(entry.last_seen_ns) / NANOS_PER_SECOND,
            })
            .collect()
    }

    pub fn records_exported(&self) -> u64 {
        self.frames.records_exported
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames.frames_sent
    }

    pub fn table_full_drops(&self) -> u64 {
        self.table_full_drops
    }

    pub fn pending_records(&self) -> u32 {
        self.frames.pending_records()
    }
}

/// Applies one timer expiration to its entry.
///
/// Expirations whose handle no longer matches the entry's armed timer
/// are stale (the slot was freed and reused) and are ignored.
#[allow(clippy::too_many_arguments)]
fn expire(
    table: &mut FlowTable,
    wheel: &mut TimerWheel,
    frames: &mut FrameSet,
    expiration: Expiration,
    active: Duration,
    passive: Duration,
    now_ns: u64,
    ctx: &ProbeContext,
) {
    let index: EntryIndex = expiration.entry;
    let Some(entry) = table.get_mut(index) else {
        return;
    };
    match expiration.kind {
        TimerKind::Active => {
            if entry.active_timer != Some(expiration.handle) {
                return;
            }
            entry.active_timer = None;
            if entry.packets > 0 {
                frames.append(entry, now_ns, ctx);
                entry.reset_counters(now_ns);
            } else if passive.is_zero() {
                // Nothing else would ever evict an idle entry.
                table.remove(index);
                return;
            }
            entry.active_timer = Some(wheel.start(index, TimerKind::Active, active));
        }
        TimerKind::Passive => {
            if entry.passive_timer != Some(expiration.handle) {
                return;
            }
            entry.passive_timer = None;
            let passive_ns = passive.as_nanos() as u64;
            let idle_ns = now_ns.saturating_sub(entry.last_seen_ns);
            if idle_ns < passive_ns {
                let remaining = Duration::from_nanos(passive_ns - idle_ns);
                entry.passive_timer = Some(wheel.start(index, TimerKind::Passive, remaining));
                return;
            }
            if entry.packets > 0 {
                frames.append(entry, now_ns, ctx);
            }
            if let Some(handle) = entry.active_timer.take() {
                wheel.stop(handle);
            }
            table.remove(index);
        }
    }
}

/// The channels and shared state of one worker.
pub struct WorkerHandle {
    pub id: usize,
    pub(crate) state: Arc<Mutex<WorkerState>>,
    ingress_tx: Sender<Vec<PacketMeta>>,
    ingress_rx: Receiver<Vec<PacketMeta>>,
    signal_tx: Sender<WorkerSignal>,
    signal_rx: Receiver<WorkerSignal>,
    expired_rx: Receiver<Expiration>,
    /// Set when the last tick hit the expiration budget
    behind: AtomicBool,
    ingress_drops: AtomicU64,
}

impl WorkerHandle {
    pub fn new(id: usize) -> Self {
        let (ingress_tx, ingress_rx) = bounded(INGRESS_QUEUE_DEPTH);
        let (signal_tx, signal_rx) = bounded(1);
        let (expired_tx, expired_rx) = unbounded();
        Self {
            id,
            state: Arc::new(Mutex::new(WorkerState::new(
                id,
                expired_tx,
                expired_rx.clone(),
            ))),
            ingress_tx,
            ingress_rx,
            signal_tx,
            signal_rx,
            expired_rx,
            behind: AtomicBool::new(false),
            ingress_drops: AtomicU64::new(0),
        }
    }

    /// Queues a batch without blocking. A full queue drops the batch.
    pub fn submit(&self, batch: Vec<PacketMeta>) -> bool {
        let len = batch.len() as u64;
        match self.ingress_tx.try_send(batch) {
            Ok(()) => true,
            Err(_) => {
                self.ingress_drops.fetch_add(len, Ordering::Relaxed);
                false
            }
        }
    }

    /// Requests a tick. An interrupt already pending is enough.
    pub fn interrupt(&self) {
        match self.signal_tx.try_send(WorkerSignal::Interrupt) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                warn!("Worker {} is not listening for interrupts", self.id)
            }
        }
    }

    pub fn shutdown(&self) {
        if self.signal_tx.send(WorkerSignal::Shutdown).is_err() {
            warn!("Worker {} already stopped", self.id);
        }
    }

    /// Expirations waiting to be drained, or 1 if the wheel still owes
    /// expirations from the last tick.
    pub fn backlog(&self) -> usize {
        self.expired_rx.len().max(usize::from(self.behind.load(Ordering::Relaxed)))
    }

    pub fn ingress_drops(&self) -> u64 {
        self.ingress_drops.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> WorkerStatistics {
        let state = self.state.lock();
        let (entries, utilisation_percent) = state
            .table()
            .map(|t| (t.len(), t.utilisation_percent()))
            .unwrap_or((0, 0.0));
        WorkerStatistics {
            worker: self.id,
            entries,
            utilisation_percent,
            table_full_drops: state.table_full_drops(),
            ingress_drops: self.ingress_drops(),
            records_exported: state.records_exported(),
            frames_sent: state.frames_sent(),
        }
    }
}

/// Starts the thread for worker `id`.
pub fn spawn_worker(ctx: Arc<ProbeContext>, id: usize) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(format!("delayprobe-worker-{id}"))
        .spawn(move || run_worker(ctx, id))?;
    Ok(handle)
}

fn now_ns() -> u64 {
    boot_time_nanos().unwrap_or(0)
}

fn run_worker(ctx: Arc<ProbeContext>, id: usize) {
    let Some(worker) = ctx.workers.get(id) else {
        warn!("No worker {id}");
        return;
    };
    info!("Worker {id} started");
    loop {
        select! {
            recv(worker.ingress_rx) -> batch => match batch {
                Ok(batch) => {
                    let now = now_ns();
                    let mut state = worker.state.lock();
                    for packet in batch.iter() {
                        state.process_packet(packet, now, &ctx);
                    }
                }
                Err(_) => break,
            },
            recv(worker.signal_rx) -> signal => match signal {
                Ok(WorkerSignal::Interrupt) => {
                    let handled = worker.state.lock().handle_interrupt(now_ns(), &ctx);
                    worker.behind.store(handled >= MAX_EXPIRATIONS, Ordering::Relaxed);
                }
                Ok(WorkerSignal::Shutdown) | Err(_) => {
                    let now = now_ns();
                    let mut state = worker.state.lock();
                    for batch in worker.ingress_rx.try_iter() {
                        for packet in batch.iter() {
                            state.process_packet(packet, now, &ctx);
                        }
                    }
                    state.export_and_flush(now, &ctx);
                    break;
                }
            },
        }
    }
    info!("Worker {id} stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::test_context::{context, enable_at_zero};
    use crate::context::FlowParams;
    use crate::exporter::capture::CaptureSink;
    use crate::ipfix::{decode_srh_record, parse_message, SrhRecord};
    use crate::packet::test_packets::srv6_packet;
    use delayprobe_config::{FlowDirection, RecordFlags};

    const SECOND: u64 = 1_000_000_000;
    const RECORD_LEN: usize = 342;

    fn params(active_timer: u32, passive_timer: u32) -> FlowParams {
        FlowParams {
            record: RecordFlags::L3,
            active_timer,
            passive_timer,
        }
    }

    fn setup(log2_size: u8, params: FlowParams) -> (Arc<ProbeContext>, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::default());
        let (ctx, _scheduler) = context(1, log2_size, 8, sink.clone());
        enable_at_zero(&ctx, 1, params);
        (ctx, sink)
    }

    fn packet(port: u16, length: u32) -> PacketMeta {
        let mut packet = srv6_packet("2001:db8::1", "2001:db8::2", length);
        packet.src_port = port;
        packet
    }

    fn exported(sink: &CaptureSink) -> Vec<SrhRecord> {
        let mut records = Vec::new();
        for frame in sink.take() {
            let message = parse_message(&frame).unwrap();
            for set in message.sets {
                assert_eq!(set.set_id, 256);
                for record in set.body.chunks(RECORD_LEN) {
                    records.push(decode_srh_record(record).unwrap());
                }
            }
        }
        records
    }

    #[test]
    fn counts_accumulate_per_key() {
        let (ctx, _sink) = setup(6, params(10, 30));
        let mut state = ctx.workers[0].state.lock();
        for length in [100, 200, 300] {
            state.process_packet(&packet(1, length), SECOND, &ctx);
        }
        state.process_packet(&packet(2, 64), SECOND, &ctx);

        let table = state.table().unwrap();
        assert_eq!(table.len(), 2);
        let first = table.lookup(&FlowKey::from_packet(&packet(1, 0))).unwrap();
        let second = table.lookup(&FlowKey::from_packet(&packet(2, 0))).unwrap();
        assert_ne!(first, second);
        assert_eq!(table.get(first).unwrap().packets, 3);
        assert_eq!(table.get(first).unwrap().octets, 600);
        assert_eq!(table.get(second).unwrap().packets, 1);
    }

    #[test]
    fn untracked_directions_are_ignored() {
        let (ctx, _sink) = setup(6, params(10, 30));
        let mut state = ctx.workers[0].state.lock();
        let mut rx = packet(1, 100);
        rx.direction = FlowDirection::Rx;
        rx.rx_sw_if_index = 1;
        state.process_packet(&rx, SECOND, &ctx);
        let mut other_interface = packet(1, 100);
        other_interface.tx_sw_if_index = 3;
        state.process_packet(&other_interface, SECOND, &ctx);
        assert!(state.table().unwrap().is_empty());
    }

    #[test]
    fn idle_entry_is_evicted_after_passive_timeout() {
        let (ctx, sink) = setup(6, params(10, 30));
        let mut state = ctx.workers[0].state.lock();
        state.process_packet(&packet(1, 100), SECOND / 2, &ctx);

        for second in 1..=30 {
            state.handle_interrupt(second * SECOND, &ctx);
        }
        assert_eq!(state.table().unwrap().len(), 1);
        // Last update at 0.5s: gone within passive + one tick.
        state.handle_interrupt(31 * SECOND, &ctx);
        state.handle_interrupt(31 * SECOND + SECOND / 2, &ctx);
        assert!(state.table().unwrap().is_empty());

        let records = exported(&sink);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].packets, 1);
        assert_eq!(records[0].octets, 100);
    }

    #[test]
    fn busy_entry_is_flushed_each_active_interval() {
        let (ctx, sink) = setup(6, params(5, 30));
        let mut state = ctx.workers[0].state.lock();
        let mut sent = 0;
        for second in 0..12 {
            state.process_packet(&packet(1, 10), second * SECOND + SECOND / 2, &ctx);
            sent += 1;
            state.handle_interrupt((second + 1) * SECOND, &ctx);
        }
        let table = state.table().unwrap();
        assert_eq!(table.len(), 1);
        let (_, entry) = table.iter().next().unwrap();
        assert!(entry.packets < 5);

        let records = exported(&sink);
        assert_eq!(records.len(), 2);
        let reported: u64 = records.iter().map(|r| r.packets).sum();
        assert_eq!(reported + entry.packets, sent);
        assert_eq!(records[0].octets, 10 * records[0].packets);
    }

    #[test]
    fn full_table_drops_new_flows() {
        let (ctx, _sink) = setup(4, params(10, 30));
        let mut state = ctx.workers[0].state.lock();
        for port in 0..17 {
            state.process_packet(&packet(port, 100), SECOND, &ctx);
        }
        assert_eq!(state.table_full_drops(), 1);
        let table = state.table().unwrap();
        assert_eq!(table.len(), 16);
        for port in 0..16 {
            let index = table.lookup(&FlowKey::from_packet(&packet(port, 0))).unwrap();
            assert_eq!(table.get(index).unwrap().packets, 1);
        }
    }

    #[test]
    fn stateless_mode_exports_every_packet() {
        let (ctx, sink) = setup(6, params(0, 0));
        let mut state = ctx.workers[0].state.lock();
        assert!(state.table().is_none());
        for length in [60, 70, 80] {
            state.process_packet(&packet(1, length), 0, &ctx);
        }
        assert_eq!(state.pending_records(), 3);
        state.handle_interrupt(SECOND / 2, &ctx);
        assert!(sink.take().is_empty());
        state.handle_interrupt(SECOND, &ctx);

        let records = exported(&sink);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.packets == 1));
        assert_eq!(records[2].octets, 80);
    }

    #[test]
    fn frames_stay_within_the_path_mtu() {
        let (ctx, sink) = setup(6, params(0, 0));
        let mut state = ctx.workers[0].state.lock();
        for port in 0..5 {
            state.process_packet(&packet(port, 100), 0, &ctx);
        }
        let frames = sink.take();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].len() <= 1500);
        assert_eq!(parse_message(&frames[0]).unwrap().sets[0].body.len(), 4 * RECORD_LEN);
        assert_eq!(state.pending_records(), 1);
        state.flush_all(&ctx);
        assert_eq!(state.frames_sent(), 2);
        assert_eq!(state.records_exported(), 5);
    }

    #[test]
    fn shutdown_reports_unexported_packets() {
        let (ctx, sink) = setup(6, params(10, 30));
        let mut state = ctx.workers[0].state.lock();
        state.process_packet(&packet(1, 100), SECOND, &ctx);
        state.process_packet(&packet(1, 100), SECOND, &ctx);
        state.process_packet(&packet(2, 40), SECOND, &ctx);
        state.export_and_flush(2 * SECOND, &ctx);

        let mut records = exported(&sink);
        records.sort_by_key(|r| r.packets);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].octets, 40);
        assert_eq!(records[1].packets, 2);
        assert_eq!(state.table().unwrap().len(), 2);
        state.export_and_flush(3 * SECOND, &ctx);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn full_ingress_queue_drops_batches() {
        let handle = WorkerHandle::new(0);
        for _ in 0..INGRESS_QUEUE_DEPTH {
            assert!(handle.submit(vec![packet(1, 100)]));
        }
        assert!(!handle.submit(vec![packet(1, 100), packet(2, 100)]));
        assert_eq!(handle.ingress_drops(), 2);
        handle.interrupt();
        handle.interrupt();
        assert_eq!(handle.backlog(), 0);
    }
}
