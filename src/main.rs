use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use courier_relay::sandbox::ExecutionResult;
use courier_relay::{
    Config, Daemon, DeviceRegistry, DiscoveryClient, PairingPayload, PayloadCipher, RelayClient,
    RelayClientConfig, RelayRequest, Side, ToolRegistry, connect_store, db,
    discovery::DiscoveryConfig,
};

/// Courier - record-store relay for AI services and remote tools
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Data directory override
    #[arg(long, env = "COURIER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List hosts visible through the coordination store
    Discover,
    /// Invoke a tool on a remote host
    Call {
        /// Target device id
        #[arg(short, long)]
        device: String,
        /// Tool name
        #[arg(short, long)]
        tool: String,
        /// Tool arguments as name=value pairs
        #[arg(short, long = "arg")]
        args: Vec<String>,
        /// Wait budget in seconds
        #[arg(long)]
        wait_secs: Option<u64>,
    },
    /// Relay a raw payload to a host endpoint or announced service
    Send {
        /// Target device id
        #[arg(short, long)]
        device: String,
        /// Announced service id to proxy to (omit for built-in endpoints)
        #[arg(long)]
        service: Option<Uuid>,
        /// Endpoint path
        #[arg(short, long, default_value = "/ping")]
        endpoint: String,
        /// HTTP-equivalent method
        #[arg(short, long, default_value = "POST")]
        method: String,
        /// Payload string
        #[arg(short, long)]
        payload: Option<String>,
        /// Wait budget in seconds
        #[arg(long)]
        wait_secs: Option<u64>,
    },
    /// Pairing operations
    Pair {
        #[command(subcommand)]
        action: PairCommand,
    },
    /// Validate and list local tool definitions
    Tools,
}

#[derive(Subcommand)]
enum PairCommand {
    /// Print this host's signed pairing payload for out-of-band transfer
    Show,
    /// Import a pairing payload received from a host
    Import {
        /// Base64 pairing payload
        blob: String,
    },
    /// List paired devices
    List,
    /// Remove a paired device
    Remove {
        /// Device id to remove
        device_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,courier_relay=info",
        1 => "info,courier_relay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.data_dir {
        Some(dir) => Config::load_from(dir)?,
        None => Config::load()?,
    };

    let Some(command) = cli.command else {
        // No subcommand: run the host daemon
        return Ok(Daemon::new(config)?.run().await?);
    };

    match command {
        Command::Discover => discover(&config).await,
        Command::Call {
            device,
            tool,
            args,
            wait_secs,
        } => call(&config, &device, &tool, &args, wait_secs).await,
        Command::Send {
            device,
            service,
            endpoint,
            method,
            payload,
            wait_secs,
        } => send(&config, &device, service, &endpoint, &method, payload, wait_secs).await,
        Command::Pair { action } => pair(&config, action).await,
        Command::Tools => tools(&config),
    }
}

async fn discover(config: &Config) -> anyhow::Result<()> {
    let store = connect_store(config)?;
    let client = DiscoveryClient::new(
        store,
        DiscoveryConfig {
            staleness: config.discovery.staleness,
            ..DiscoveryConfig::default()
        },
    );

    let devices = client.refresh().await?;
    if devices.is_empty() {
        println!("no devices announced");
        return Ok(());
    }

    for device in devices {
        let a = &device.announcement;
        println!(
            "{:<24} {:<10} {:>2} services  last seen {}  [{}]",
            a.device_name,
            format!("{:?}", device.presence).to_lowercase(),
            a.services.len(),
            a.last_seen.format("%Y-%m-%d %H:%M:%S"),
            a.device_id,
        );
        for service in &a.services {
            let running = if service.is_running { "up" } else { "down" };
            println!("    {:<20} {:?} port {} ({running})", service.name, service.kind, service.port);
        }
    }
    Ok(())
}

/// Build a relay client for a target device, wiring the transport cipher if
/// the pairing recorded a master key
fn relay_client_for(
    config: &Config,
    target_device_id: &str,
    wait_secs: Option<u64>,
) -> anyhow::Result<RelayClient> {
    let store = connect_store(config)?;
    let mut client_config = RelayClientConfig {
        wait_timeout: config.client.wait_timeout,
        poll_interval: config.client.poll_interval,
        ..RelayClientConfig::default()
    };
    if let Some(secs) = wait_secs {
        client_config.wait_timeout = Duration::from_secs(secs);
    }

    let mut client = RelayClient::new(store, client_config);

    let pool = db::init(config.db_path())?;
    let registry = DeviceRegistry::new(pool);
    if let Some(paired) = registry.get(target_device_id)? {
        registry.touch(target_device_id)?;
        if let Some(master_key) = &paired.master_key {
            let cipher = PayloadCipher::from_master_key(master_key, Side::Client)?;
            client = client.with_cipher(std::sync::Arc::new(cipher));
        }
    }

    Ok(client)
}

async fn call(
    config: &Config,
    device: &str,
    tool: &str,
    args: &[String],
    wait_secs: Option<u64>,
) -> anyhow::Result<()> {
    let mut arg_map = serde_json::Map::new();
    for pair in args {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("argument {pair:?} is not name=value"))?;
        // Values parse as JSON scalars where possible, strings otherwise
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        arg_map.insert(name.to_string(), value);
    }

    let payload = serde_json::json!({ "tool": tool, "args": arg_map });
    let client = relay_client_for(config, device, wait_secs)?;
    let request = RelayRequest::new(device, None, "/tools/run", "POST", payload.to_string().into_bytes());

    println!("request {} -> {device}", request.id);
    let response = client.send(request).await?;

    match serde_json::from_slice::<ExecutionResult>(&response.payload) {
        Ok(result) => {
            println!(
                "outcome: {:?}  ({} ms)",
                result.outcome, result.duration_ms
            );
            if let Some(code) = result.exit_status {
                println!("exit: {code}");
            }
            if let Some(status) = result.http_status {
                println!("status: {status}");
            }
            if !result.stdout.is_empty() {
                println!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprintln!("{}", result.stderr);
            }
        }
        Err(_) => {
            println!("status {}", response.status_code);
            println!("{}", String::from_utf8_lossy(&response.payload));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn send(
    config: &Config,
    device: &str,
    service: Option<Uuid>,
    endpoint: &str,
    method: &str,
    payload: Option<String>,
    wait_secs: Option<u64>,
) -> anyhow::Result<()> {
    let client = relay_client_for(config, device, wait_secs)?;
    let request = RelayRequest::new(
        device,
        service,
        endpoint,
        method,
        payload.map(String::into_bytes).unwrap_or_default(),
    );

    println!("request {} -> {device}{endpoint}", request.id);
    let response = client.send(request).await?;
    println!("status {}", response.status_code);
    println!("{}", String::from_utf8_lossy(&response.payload));
    Ok(())
}

async fn pair(config: &Config, action: PairCommand) -> anyhow::Result<()> {
    match action {
        PairCommand::Show => {
            let daemon = Daemon::new(config.clone())?;
            let payload = daemon.pairing_payload().await?;
            println!("{}", payload.encode()?);
        }
        PairCommand::Import { blob } => {
            let payload = PairingPayload::decode(&blob)?;
            payload.verify()?;

            let pool = db::init(config.db_path())?;
            let registry = DeviceRegistry::new(pool);
            registry.register(
                &payload.device_id,
                &payload.public_key,
                &payload.device_name,
                payload.master_key.as_deref(),
            )?;

            println!(
                "paired with {} [{}], {} services{}",
                payload.device_name,
                payload.device_id,
                payload.services.len(),
                if payload.master_key.is_some() {
                    ", transport encryption on"
                } else {
                    ""
                }
            );
        }
        PairCommand::List => {
            let pool = db::init(config.db_path())?;
            let registry = DeviceRegistry::new(pool);
            for device in registry.list()? {
                println!(
                    "{:<24} [{}] paired {}",
                    device.name,
                    device.id,
                    device.paired_at.format("%Y-%m-%d"),
                );
            }
        }
        PairCommand::Remove { device_id } => {
            let pool = db::init(config.db_path())?;
            let registry = DeviceRegistry::new(pool);
            if registry.remove(&device_id)? {
                println!("removed {device_id}");
            } else {
                println!("{device_id} was not paired");
            }
        }
    }
    Ok(())
}

fn tools(config: &Config) -> anyhow::Result<()> {
    let registry = ToolRegistry::load(&config.host.tools_dir)?;
    let tools = registry.list();
    if tools.is_empty() {
        println!("no tools defined in {}", config.host.tools_dir.display());
        return Ok(());
    }

    for tool in tools {
        println!(
            "{:<20} {:?} timeout {}s  {}",
            tool.name,
            tool.execution.kind,
            tool.execution.timeout,
            tool.description,
        );
    }
    Ok(())
}
