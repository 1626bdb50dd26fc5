/// FDX <-> Modbus RTU bridge service
///
/// Usage: `fdx_bridge [CONFIG] [--simulate] [--poll] [--packets]`
///
/// - `CONFIG`: JSON or YAML configuration, default `config/bridge.json`
/// - `--simulate`: run against an in-memory bus built from `slaves_list`
/// - `--poll`: enable cyclic polling right after connecting
/// - `--packets`: print every frame, decoded and as hex, on the console
///
/// Logging follows `RUST_LOG`; without `--packets`, frames go to the `packets`
/// target, e.g. `RUST_LOG=info,packets=info`.
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fdx_modbus_bridge::utils::format::format_metrics;
use fdx_modbus_bridge::{
    Bridge, BridgeConfig, CallbackLogger, FdxTransport, LogLevel, LoggingMode, ModbusRtuClient, ModbusTransport,
    RtuTransport, SimulatedBus,
};

const DEFAULT_CONFIG_PATH: &str = "config/bridge.json";

struct Options {
    config_path: String,
    simulate: bool,
    poll: bool,
    packets: bool,
}

fn parse_args() -> Result<Options> {
    let mut options = Options {
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        simulate: false,
        poll: false,
        packets: false,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--simulate" => options.simulate = true,
            "--poll" => options.poll = true,
            "--packets" => options.packets = true,
            flag if flag.starts_with("--") => anyhow::bail!("unknown option {}", flag),
            path => options.config_path = path.to_string(),
        }
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,packets=warn")))
        .init();

    let options = parse_args()?;
    let config = BridgeConfig::from_file(&options.config_path)
        .with_context(|| format!("loading {}", options.config_path))?;
    info!("{} starting with {}", fdx_modbus_bridge::info(), options.config_path);

    let packets = if options.packets {
        CallbackLogger::console(LoggingMode::Both)
    } else {
        CallbackLogger::tracing(LogLevel::Debug, LoggingMode::Interpreted)
    };

    if options.simulate {
        let bus = config
            .slaves_list
            .iter()
            .fold(SimulatedBus::new(), |bus, (&slave_id, &count)| bus.with_slave(slave_id, count));
        let mut client = ModbusRtuClient::<SimulatedBus>::new(&config).with_logger(packets.clone());
        client
            .connect_with(bus)
            .await
            .context("connecting to simulated bus")?;
        run(&config, client, packets, options.poll).await
    } else {
        let mut client = ModbusRtuClient::<RtuTransport>::new(&config).with_logger(packets.clone());
        client
            .connect()
            .await
            .with_context(|| format!("connecting to {}", config.port))?;
        run(&config, client, packets, options.poll).await
    }
}

async fn run<T: ModbusTransport + 'static>(
    config: &BridgeConfig,
    mut client: ModbusRtuClient<T>,
    packets: CallbackLogger,
    poll: bool,
) -> Result<()> {
    let transport = Arc::new(FdxTransport::new(&config.fdx).with_logger(packets));
    let bridge = Arc::new(Bridge::new(config, transport, client.queue()));
    client.set_response_handler(bridge.clone());

    if let Err(e) = bridge.open().await {
        client.disconnect().await.ok();
        return Err(e).context("opening FDX transport");
    }
    if poll {
        client.enable_cyclic_polling();
    }
    info!("Bridge running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");

    client.disable_cyclic_polling();
    if let Err(e) = client.disconnect().await {
        warn!("Modbus disconnect failed: {}", e);
    }
    bridge.close().await.context("closing FDX transport")?;

    info!("{}", format_metrics(&client.metrics()));
    let stats = bridge.transport().get_stats();
    info!(
        "FDX frames: {} sent, {} received, {} dropped",
        stats.frames_sent, stats.frames_received, stats.frames_dropped
    );
    Ok(())
}
