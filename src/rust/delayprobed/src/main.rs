use anyhow::Result;
use delayprobe_bus::{BusRequest, BusResponse, RequestHandler, UnixSocketServer};
use delayprobed::{handle_bus_requests, ProbeRuntime, UdpCollector};
use signal_hook::{
  consts::{SIGHUP, SIGINT, SIGTERM},
  iterator::Signals,
};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};

/// `RUST_LOG` names the level (trace, debug, info, warn or error).
/// Anything else, or nothing, means warn.
fn log_level() -> LevelFilter {
  std::env::var("RUST_LOG")
    .ok()
    .and_then(|level| level.to_lowercase().parse().ok())
    .filter(|level| *level != LevelFilter::OFF)
    .unwrap_or(LevelFilter::WARN)
}

/// Compact console logging with source locations.
pub fn set_console_logging() -> anyhow::Result<()> {
  let subscriber = tracing_subscriber::fmt()
    .with_max_level(log_level())
    .compact()
    .with_file(true)
    .with_line_number(true)
    .with_thread_ids(false)
    .with_target(false)
    .finish();
  tracing::subscriber::set_global_default(subscriber)?;
  Ok(())
}

fn main() -> Result<()> {
  set_console_logging()?;
  info!("delayprobe daemon starting");

  let config = delayprobe_config::load_config()?;
  let collector = Arc::new(UdpCollector::new(&config.exporter)?);
  let runtime = ProbeRuntime::start(&config, collector)?;
  let controller = runtime.controller();

  // SIGINT and SIGTERM export what the workers hold, then exit.
  let mut signals = Signals::new([SIGINT, SIGHUP, SIGTERM])?;
  let mut runtime = Some(runtime);
  std::thread::Builder::new().name("Signal Handler".to_string()).spawn(move || {
    for sig in signals.forever() {
      if sig == SIGHUP {
        warn!("SIGHUP received; configuration changes are made over the bus");
        continue;
      }
      warn!("Stopping on signal {sig}");
      if let Some(runtime) = runtime.take() {
        runtime.shutdown();
      }
      UnixSocketServer::signal_cleanup();
      std::process::exit(0);
    }
  })?;

  let server = UnixSocketServer::new()?;
  let handler: RequestHandler = Arc::new(
    move |requests: &[BusRequest], responses: &mut Vec<BusResponse>| {
      handle_bus_requests(&controller, requests, responses)
    },
  );

  let handle = std::thread::Builder::new().name("Async Bus".to_string()).spawn(move || {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
      Ok(rt) => rt,
      Err(e) => {
        error!("Unable to start the bus runtime: {e:?}");
        return;
      }
    };
    rt.block_on(async {
      if let Err(e) = server.listen(handler).await {
        error!("Bus server failed: {e:?}");
      }
    });
  })?;
  wait_for(handle, "Async Bus");
  warn!("Main thread exiting");
  Ok(())
}

/// Joins `handle`, logging a panic. Returns false if the thread panicked.
fn wait_for(handle: JoinHandle<()>, name: &str) -> bool {
  match handle.join() {
    Ok(()) => true,
    Err(e) => {
      error!("{name} thread panicked: {e:?}");
      false
    }
  }
}
