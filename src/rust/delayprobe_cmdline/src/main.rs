use anyhow::{Error, Result};
use clap::{Parser, Subcommand};
use delayprobe_bus::{
    bus_request, BusRequest, BusResponse, FlowDirection, FlowEntrySummary, FlowVariant,
    InterfaceDetail, ProbeParams, RecordFlags, TableStatistics,
};
use std::process::exit;

#[derive(Parser)]
#[command()]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enable or disable flow records on an interface.
    Feature {
        #[command(subcommand)]
        action: FeatureCommands,
    },
    /// Set the global flow probe parameters.
    Params {
        #[command(subcommand)]
        action: ParamsCommands,
    },
    /// Show the probe's state.
    Show {
        #[command(subcommand)]
        what: ShowCommands,
    },
    /// Check that the daemon is answering.
    Ping,
}

#[derive(Subcommand)]
enum FeatureCommands {
    /// e.g. `delayprobe feature add-del 1 srh both`
    AddDel {
        /// Interface index
        sw_if_index: u32,

        /// Flow variant ("srh")
        which: FlowVariant,

        /// "rx", "tx" or "both"
        #[arg(default_value = "tx")]
        direction: FlowDirection,

        /// Disable instead of enable
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Subcommand)]
enum ParamsCommands {
    /// e.g. `delayprobe params record l3 --active 15 --passive 120`
    Record {
        /// Layers to record. Only "l3" is supported.
        #[arg(required = true)]
        layers: Vec<String>,

        /// Active timer in seconds. 0 exports every packet.
        #[arg(long)]
        active: Option<u32>,

        /// Passive timer in seconds. 0 disables idle eviction.
        #[arg(long)]
        passive: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ShowCommands {
    /// Interfaces with flow records enabled.
    Feature {
        /// Only this interface
        #[arg(long)]
        interface: Option<u32>,
    },
    /// The current parameters.
    Params,
    /// Every live flow entry.
    Table,
    /// Table sizing and per-worker counters.
    Statistics,
}

async fn talk_to_server(command: BusRequest) -> Result<()> {
    let responses = bus_request(vec![command]).await?;
    match first_response(&responses)? {
        BusResponse::Ack => {
            println!("Success");
            Ok(())
        }
        BusResponse::Error(err) => Err(Error::msg(err.to_string())),
        BusResponse::Fail(err) => Err(Error::msg(err.clone())),
        BusResponse::Params(params) => {
            print_params(params);
            Ok(())
        }
        BusResponse::InterfaceDetails(details) => {
            print_features(details);
            Ok(())
        }
        BusResponse::FlowTable(entries) => {
            print_table(entries);
            Ok(())
        }
        BusResponse::Statistics(stats) => {
            print_statistics(stats);
            Ok(())
        }
    }
}

fn first_response(responses: &[BusResponse]) -> Result<&BusResponse> {
    responses
        .first()
        .ok_or_else(|| Error::msg("The daemon sent an empty reply"))
}

fn format_params(params: &ProbeParams) -> String {
    if params.record_flags.is_empty() {
        return "Parameters have not been set".to_string();
    }
    format!(
        "record: {} active: {} passive: {}",
        params.record_flags, params.active_timer, params.passive_timer
    )
}

fn print_params(params: &ProbeParams) {
    println!("{}", format_params(params));
}

fn print_features(details: &[InterfaceDetail]) {
    for detail in details.iter() {
        println!(" {:<8} {} {}", detail.sw_if_index, detail.which, detail.direction);
    }
}

fn print_table(entries: &[FlowEntrySummary]) {
    println!("Dumping IPFIX table");
    for e in entries.iter() {
        println!(
            "[{}:{}] {} rx {} tx {} {} -> {} {} -> {} proto {} {} -> {} sr {} -> {} left {} packets {} octets {} age {}s idle {}s",
            e.worker,
            e.index,
            e.direction,
            e.rx_sw_if_index,
            e.tx_sw_if_index,
            e.src_mac,
            e.dst_mac,
            e.src_address,
            e.dst_address,
            e.protocol,
            e.src_port,
            e.dst_port,
            e.sr_source,
            e.active_segment,
            e.segments_left,
            e.packets,
            e.octets,
            e.age_seconds,
            e.idle_seconds,
        );
    }
}

fn print_statistics(stats: &TableStatistics) {
    println!("IPFIX table statistics");
    if !stats.initialized {
        println!("Not initialized: no interface has been enabled yet");
        return;
    }
    println!("Flow entry size: {}", stats.entry_size_bytes);
    if stats.stateful {
        println!("Flow pool size per thread: {}", stats.pool_capacity);
    } else {
        println!("Stateless: every packet is exported");
    }
    println!(
        "{:<8} {:>8} {:>6} {:>12} {:>12} {:>12} {:>10}",
        "Worker", "Entries", "Use%", "Table full", "Queue full", "Records", "Frames"
    );
    for w in stats.workers.iter() {
        println!(
            "{:<8} {:>8} {:>6.1} {:>12} {:>12} {:>12} {:>10}",
            w.worker,
            w.entries,
            w.utilisation_percent,
            w.table_full_drops,
            w.ingress_drops,
            w.records_exported,
            w.frames_sent
        );
    }
}

fn parse_record(
    layers: &[String],
    active: Option<u32>,
    passive: Option<u32>,
) -> Result<BusRequest> {
    let record_flags = RecordFlags::from_names(layers)
        .ok_or_else(|| Error::msg(format!("Unknown record layer in {layers:?}")))?;
    if let (Some(active), Some(passive)) = (active, passive) {
        if passive > 0 && active > passive {
            return Err(Error::msg(
                "Passive timer has to be greater than the active one",
            ));
        }
    }
    Ok(BusRequest::SetParams {
        record_flags,
        active_timer: active,
        passive_timer: passive,
    })
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result<()> {
    let cli = Args::parse();

    match cli.command {
        Some(Commands::Feature {
            action:
                FeatureCommands::AddDel {
                    sw_if_index,
                    which,
                    direction,
                    disable,
                },
        }) => {
            talk_to_server(BusRequest::InterfaceAddDel {
                sw_if_index,
                which,
                direction,
                is_add: !disable,
            })
            .await?
        }
        Some(Commands::Params {
            action:
                ParamsCommands::Record {
                    layers,
                    active,
                    passive,
                },
        }) => talk_to_server(parse_record(&layers, active, passive)?).await?,
        Some(Commands::Show { what }) => {
            let request = match what {
                ShowCommands::Feature { interface } => BusRequest::InterfaceDump {
                    sw_if_index: interface,
                },
                ShowCommands::Params => BusRequest::GetParams,
                ShowCommands::Table => BusRequest::ShowTable,
                ShowCommands::Statistics => BusRequest::ShowStatistics,
            };
            talk_to_server(request).await?
        }
        Some(Commands::Ping) => talk_to_server(BusRequest::Ping).await?,
        None => {
            println!("Run with --help to see instructions");
            exit(0);
        }
    }

    Ok(())
}
