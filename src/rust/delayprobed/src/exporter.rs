//! Finished frames leave the process through a [`FrameSink`].

use crate::flow_table::FlowEntry;
use crate::ipfix::headers::{patch_lengths, stamp, write_headers, MESSAGE_OFFSET, SET_OFFSET};
use crate::ipfix::{encode_record, PacketBuilder, Template, Transport};
use delayprobe_config::ExporterConfig;
use delayprobe_utils::unix_time::export_seconds;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Where finished IPv4/UDP/IPFIX frames go.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &[u8]) -> Result<(), ExportError>;
}

/// Sends the IPFIX message of each frame to the collector over a UDP
/// socket. The kernel supplies its own IPv4 and UDP headers.
pub struct UdpCollector {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpCollector {
    pub fn new(config: &ExporterConfig) -> Result<Self, ExportError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let target = SocketAddr::V4(SocketAddrV4::new(
            config.collector_address,
            config.collector_port,
        ));
        info!("Exporting IPFIX to {target}");
        Ok(Self { socket, target })
    }
}

impl FrameSink for UdpCollector {
    fn send_frame(&self, frame: &[u8]) -> Result<(), ExportError> {
        if frame.len() <= MESSAGE_OFFSET {
            return Err(ExportError::Truncated);
        }
        self.socket.send_to(&frame[MESSAGE_OFFSET..], self.target)?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame has no IPFIX payload")]
    Truncated,
}

/// Shared by every worker: stamps frames with export time and the
/// stream sequence number, and hands them to the sink.
pub struct Exporter {
    sink: Arc<dyn FrameSink>,
    transport: Transport,
    path_mtu: usize,
    /// Data records sent so far on the stream
    sequence: AtomicU32,
    frames_sent: AtomicU64,
    templates_sent: AtomicU64,
    send_failures: AtomicU64,
}

impl Exporter {
    pub fn new(sink: Arc<dyn FrameSink>, transport: Transport, path_mtu: usize) -> Self {
        Self {
            sink,
            transport,
            path_mtu,
            sequence: AtomicU32::new(0),
            frames_sent: AtomicU64::new(0),
            templates_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn path_mtu(&self) -> usize {
        self.path_mtu
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn templates_sent(&self) -> u64 {
        self.templates_sent.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    fn export_time() -> u32 {
        export_seconds().unwrap_or(0)
    }

    /// Sends a copy of the template datagram. Templates carry the current
    /// sequence number without advancing it.
    pub fn send_template(&self, template: &Template) {
        let mut frame = template.frame.clone();
        stamp(
            &mut frame,
            Self::export_time(),
            self.sequence.load(Ordering::Relaxed),
        );
        if self.transmit(&frame) {
            self.templates_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Finalizes and sends a data frame. Its records are counted into the
    /// sequence even if the send fails; the collector sees them as lost.
    pub fn send_data(&self, frame: DataFrame) {
        if frame.records == 0 {
            return;
        }
        let records = frame.records;
        let mut bytes = frame.finish();
        let sequence = self.sequence.fetch_add(records, Ordering::Relaxed);
        stamp(&mut bytes, Self::export_time(), sequence);
        if self.transmit(&bytes) {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn transmit(&self, frame: &[u8]) -> bool {
        match self.sink.send_frame(frame) {
            Ok(()) => true,
            Err(e) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to send IPFIX frame: {e}");
                false
            }
        }
    }
}

/// A data frame being filled by one worker for one variant.
pub struct DataFrame {
    builder: PacketBuilder,
    records: u32,
    opened_ns: u64,
}

impl DataFrame {
    /// Opens a frame whose data set uses `template_id`.
    pub fn new(transport: &Transport, template_id: u16, path_mtu: usize, now_ns: u64) -> Self {
        let mut builder = PacketBuilder::with_capacity(path_mtu);
        write_headers(&mut builder, transport, template_id);
        Self {
            builder,
            records: 0,
            opened_ns: now_ns,
        }
    }

    /// Would a record of `record_len` bytes keep the frame within the MTU?
    pub fn has_room(&self, record_len: usize, path_mtu: usize) -> bool {
        self.builder.len() + record_len <= path_mtu
    }

    pub fn push(&mut self, entry: &FlowEntry) {
        encode_record(entry, &mut self.builder);
        self.records += 1;
    }

    pub fn records(&self) -> u32 {
        self.records
    }

    pub fn len(&self) -> usize {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn opened_ns(&self) -> u64 {
        self.opened_ns
    }

    fn finish(mut self) -> Vec<u8> {
        debug_assert!(self.builder.len() > SET_OFFSET);
        patch_lengths(&mut self.builder);
        self.builder.into_vec()
    }
}


#[cfg(test)]
mod test {
    use super::capture::CaptureSink;
    use super::*;
    use crate::flow_table::{FlowKey, FlowTable};
    use crate::ipfix::{build_template, decode_srh_record, parse_message, parse_template};
    use crate::packet::test_packets::srv6_packet;
    use delayprobe_config::FlowVariant;

    fn transport() -> Transport {
        Transport {
            src_address: "192.0.2.1".parse().unwrap(),
            dst_address: "192.0.2.10".parse().unwrap(),
            src_port: 4739,
            dst_port: 4739,
            domain_id: 9,
        }
    }

    fn entry(port: u16, packets: u32) -> FlowEntry {
        let mut packet = srv6_packet("2001:db8::1", "2001:db8::2", 0);
        packet.src_port = port;
        let mut table = FlowTable::new(2);
        let (index, _) = table
            .lookup_or_create(FlowKey::from_packet(&packet), FlowVariant::Srh, 0)
            .unwrap();
        let entry = table.get_mut(index).unwrap();
        for _ in 0..packets {
            entry.update(100, 0);
        }
        entry.clone()
    }

    #[test]
    fn sequence_counts_records_before_each_message() {
        let sink = Arc::new(CaptureSink::default());
        let exporter = Exporter::new(sink.clone(), transport(), 1500);
        let template = build_template(FlowVariant::Srh, &transport(), 256);

        let mut first = DataFrame::new(&transport(), 256, 1500, 0);
        first.push(&entry(1, 1));
        first.push(&entry(2, 2));
        exporter.send_data(first);
        exporter.send_template(&template);
        let mut second = DataFrame::new(&transport(), 256, 1500, 0);
        second.push(&entry(3, 3));
        exporter.send_data(second);

        let frames = sink.take();
        assert_eq!(frames.len(), 3);
        assert_eq!(parse_message(&frames[0]).unwrap().sequence, 0);
        assert_eq!(parse_message(&frames[1]).unwrap().sequence, 2);
        assert_eq!(parse_template(&frames[1]).unwrap().template_id, 256);
        let last = parse_message(&frames[2]).unwrap();
        assert_eq!(last.sequence, 2);
        assert_eq!(last.domain_id, 9);
        assert_eq!(last.sets[0].set_id, 256);
        assert_eq!(decode_srh_record(last.sets[0].body).unwrap().packets, 3);
        assert_eq!(exporter.frames_sent(), 2);
        assert_eq!(exporter.templates_sent(), 1);
    }

    #[test]
    fn data_set_length_covers_records() {
        let sink = Arc::new(CaptureSink::default());
        let exporter = Exporter::new(sink.clone(), transport(), 1500);
        let mut frame = DataFrame::new(&transport(), 256, 1500, 0);
        for port in 0..4 {
            assert!(frame.has_room(342, 1500));
            frame.push(&entry(port, 1));
        }
        assert!(!frame.has_room(342, 1500));
        exporter.send_data(frame);
        let frames = sink.take();
        let message = parse_message(&frames[0]).unwrap();
        assert_eq!(message.sets[0].length, 4 + 4 * 342);
        assert_eq!(frames[0].len(), SET_OFFSET + 4 + 4 * 342);
    }

    #[test]
    fn empty_frames_are_not_sent() {
        let sink = Arc::new(CaptureSink::default());
        let exporter = Exporter::new(sink.clone(), transport(), 1500);
        exporter.send_data(DataFrame::new(&transport(), 256, 1500, 0));
        assert!(sink.take().is_empty());
    }
}
