use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

use droidfs::admin::{self, Status};
use droidfs::config::{self, Config, DEFAULT_PORT, KIB, MIB, TransportMode};
use droidfs::device::{self, Adb};

#[derive(Parser)]
#[command(name = "droidfs", version, about = "Mount an Android device's filesystem over adb")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the device filesystem via FUSE.
    #[cfg(feature = "fuse")]
    Mount(MountArgs),
    /// List attached devices.
    Devices(DevicesArgs),
    /// Send one control operation to a running mount.
    Msg(MsgArgs),
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    /// Companion channel, falling back to per-command adb if it cannot start.
    Auto,
    Channel,
    Command,
}

#[derive(Args)]
struct MountArgs {
    /// Directory to mount the filesystem.
    #[arg(value_name = "MOUNT_POINT")]
    mount_point: PathBuf,

    /// Device serial. Defaults to the only attached device.
    #[arg(long, env = "ANDROID_SERIAL")]
    serial: Option<String>,

    /// Local companion binary to push to the device.
    #[arg(long, value_name = "PATH")]
    server: Option<PathBuf>,

    /// Port forwarded to the companion.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, value_enum, default_value_t = TransportArg::Auto)]
    transport: TransportArg,

    /// Page size in KiB.
    #[arg(long, default_value_t = 128)]
    page_size: u64,

    /// Cache budget in MiB.
    #[arg(long, default_value_t = 256)]
    cache_size: u64,

    /// Page and attribute freshness in seconds.
    #[arg(long, default_value_t = 30)]
    ttl: u64,

    /// Companion request timeout in seconds, 0 disables it.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[arg(long, default_value = "warn")]
    log_level: String,

    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Path of the adb executable.
    #[arg(long, default_value = "adb")]
    adb: PathBuf,

    /// Control socket path.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

#[derive(Args)]
struct DevicesArgs {
    #[arg(long, default_value = "adb")]
    adb: PathBuf,
}

#[derive(Args)]
struct MsgArgs {
    /// Operation name, e.g. `info` or `set_ttl`.
    op: String,

    /// Operation argument, parsed as JSON when possible.
    value: Option<String>,

    #[arg(long, env = "ANDROID_SERIAL")]
    serial: Option<String>,

    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[arg(long, default_value = "adb")]
    adb: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        #[cfg(feature = "fuse")]
        Command::Mount(args) => mount_cmd(args).await?,
        Command::Devices(args) => devices_cmd(args).await?,
        Command::Msg(args) => msg_cmd(args).await?,
    }
    Ok(())
}

async fn pick_serial(adb: &Adb, serial: Option<String>) -> anyhow::Result<String> {
    if let Some(s) = serial {
        return Ok(s);
    }
    let devices = adb.devices().await.context("cannot list devices")?;
    Ok(device::select_device(&devices)?)
}

fn build_config(args: &MountArgs) -> Config {
    let page_size = config::normalize_page_size(args.page_size.saturating_mul(KIB));
    let budget = config::normalize_cache_budget(args.cache_size.saturating_mul(MIB), page_size);
    let mode = match args.transport {
        TransportArg::Command => TransportMode::Command,
        TransportArg::Auto | TransportArg::Channel => TransportMode::Channel,
    };
    Config::default()
        .with_page_size(page_size)
        .with_cache_budget(budget)
        .with_ttl(Duration::from_secs(args.ttl))
        .with_rpc_timeout(Duration::from_secs(args.timeout))
        .with_log_level(args.log_level.clone())
        .with_transport_mode(mode)
}

#[cfg(feature = "fuse")]
async fn mount_cmd(args: MountArgs) -> anyhow::Result<()> {
    use droidfs::admin::AdminService;
    use droidfs::companion::CompanionConfig;
    use droidfs::config::ConfigRegistry;
    use droidfs::engine::Bridge;
    use droidfs::fuse::DroidFs;
    use droidfs::fuse::mount::mount_bridge_unprivileged;
    use droidfs::logging::{self, LogControl};
    use droidfs::remote;
    use std::sync::Arc;
    use tracing::{info, warn};

    let log = logging::init(&args.log_level, args.log_file.as_deref())
        .context("cannot set up logging")?;

    if !args.mount_point.exists() {
        std::fs::create_dir_all(&args.mount_point)?;
    }
    if !args.mount_point.is_dir() {
        bail!("mount point must be a directory");
    }

    let adb = Adb::new(&args.adb);
    let serial = pick_serial(&adb, args.serial.clone()).await?;
    let adb = adb.with_serial(&serial);

    let config = Arc::new(ConfigRegistry::new(build_config(&args)));
    let companion = CompanionConfig {
        binary: args.server.clone(),
        port: args.port,
        ..CompanionConfig::default()
    };
    let fallback = args.transport == TransportArg::Auto;
    let transport = remote::establish(adb, companion, fallback, config.clone())
        .await
        .with_context(|| format!("cannot reach device {serial}"))?;
    let bridge = Bridge::new(config, transport);
    info!(serial = %serial, transport = bridge.transport_name(), "bridge ready");

    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| admin::default_socket_path(&serial));
    let listener = admin::bind(&socket)
        .with_context(|| format!("cannot bind control socket {}", socket.display()))?;
    let log: Arc<dyn LogControl> = log;
    let service = Arc::new(AdminService::new(bridge.clone(), Some(log)));
    let control = tokio::spawn(service.serve(listener));

    let handle = mount_bridge_unprivileged(DroidFs::new(bridge.clone()), &args.mount_point)
        .await
        .context("mount failed (is fusermount3 available?)")?;

    println!("mounted {serial} at {}", args.mount_point.display());
    tokio::signal::ctrl_c().await?;
    println!("unmounting...");
    if let Err(e) = handle.unmount().await {
        warn!(error = %e, "unmount failed");
    }
    control.abort();
    if let Err(e) = std::fs::remove_file(&socket) {
        warn!(error = %e, "cannot remove control socket");
    }
    bridge.shutdown().await.context("pending writes were not flushed")?;
    Ok(())
}

async fn devices_cmd(args: DevicesArgs) -> anyhow::Result<()> {
    let devices = Adb::new(&args.adb)
        .devices()
        .await
        .context("cannot list devices")?;
    if devices.is_empty() {
        println!("no devices attached");
    }
    for d in devices {
        println!("{}\t{}", d.serial, d.state);
    }
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn msg_cmd(args: MsgArgs) -> anyhow::Result<()> {
    let socket = match args.socket {
        Some(s) => s,
        None => admin::default_socket_path(&pick_serial(&Adb::new(&args.adb), args.serial).await?),
    };
    let resp = admin::request(&socket, &args.op, args.value.as_deref().map(parse_value))
        .await
        .with_context(|| format!("no mount answering on {}", socket.display()))?;
    let text = match &resp.value {
        Value::String(s) => s.clone(),
        v => serde_json::to_string_pretty(v)?,
    };
    match resp.status {
        Status::Success => {
            println!("{text}");
            Ok(())
        }
        Status::Error => bail!("{} failed: {text}", args.op),
    }
}
