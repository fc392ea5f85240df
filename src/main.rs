extern crate clap;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colored::Colorize;
use log::debug;
use netpulse::config::{Settings, SettingsHandle};
use netpulse::errors::{exit_codes, MonitorError, Result};
use netpulse::measurements::{LatencySample, Measurement};
use netpulse::packet::{
    broadcast, multicast, unicast, AnycastTarget, BroadcastTarget, MulticastTarget,
    PacketTarget, PacketTestEngine, PacketTestMode, UnicastTarget,
};
use netpulse::persistence::{export_json, CsvLog};
use netpulse::probes::ProbeSet;
use netpulse::scheduler::MonitorScheduler;
use netpulse::sink::{ChannelSink, FanoutSink, LogSink, MonitorEvent, MonitorSink};
use netpulse::upnp::{PortMapping, PortMappingAction, Protocol, UpnpController};
use netpulse::{net, stats, tools};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(author, version = env!("NETPULSE_VERSION"), about, long_about = None)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure throughput, ping statistics and HTTP response time periodically
    Monitor(MonitorArgs),
    /// Ping a host once
    UnicastPing { host: String },
    /// Run a continuous packet test until interrupted
    Packet(PacketArgs),
    /// Manage port mappings on the UPnP gateway
    #[command(subcommand)]
    Upnp(UpnpCommand),
    /// Trace the route to a host
    Traceroute { host: String },
    /// List active connections
    Netstat,
    /// Find reachable hosts in the local /24
    LanScan {
        /// Interface address; defaults to the outbound interface
        #[arg(long)]
        interface: Option<Ipv4Addr>,
    },
}

#[derive(Args)]
struct MonitorArgs {
    /// Label recorded with every measurement; defaults to the local IPv4
    #[arg(long)]
    interface: Option<String>,

    /// Seconds between measurements
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Stop after this many measurements
    #[arg(long)]
    count: Option<usize>,

    #[arg(long, default_value = Settings::DEFAULT_PING_TARGET)]
    ping_target: String,

    #[arg(long, default_value_t = Settings::DEFAULT_PING_COUNT)]
    ping_count: u32,

    #[arg(long, default_value = Settings::DEFAULT_SPEED_TEST_URL)]
    download_url: String,

    #[arg(long, default_value = Settings::DEFAULT_UPLOAD_URL)]
    upload_url: String,

    #[arg(long, default_value_t = Settings::DEFAULT_DOWNLOAD_BYTES)]
    download_bytes: u64,

    #[arg(long, default_value_t = Settings::DEFAULT_UPLOAD_BYTES)]
    upload_bytes: u64,

    #[arg(long, default_value = Settings::DEFAULT_HTTP_TEST_URL)]
    http_url: String,

    /// Append-only CSV log
    #[arg(long, default_value = "network_log.csv")]
    csv: PathBuf,

    /// Export the session as JSON on exit
    #[arg(long)]
    json: Option<PathBuf>,
}

impl MonitorArgs {
    fn settings(&self) -> Settings {
        Settings {
            ping_target: self.ping_target.clone(),
            ping_count: self.ping_count,
            speed_test_url: self.download_url.clone(),
            upload_url: self.upload_url.clone(),
            download_bytes: self.download_bytes,
            upload_bytes: self.upload_bytes,
            http_test_url: self.http_url.clone(),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Unicast,
    Broadcast,
    Multicast,
    Anycast,
}

#[derive(Clone, Copy, ValueEnum)]
enum AnycastArg {
    Cloudflare,
    Google,
}

#[derive(Args)]
struct PacketArgs {
    #[arg(value_enum)]
    mode: ModeArg,

    /// Unicast destination
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Destination port; defaults to the mode's standard port
    #[arg(long)]
    port: Option<u16>,

    /// Local IPv4 used for the broadcast address and group membership
    #[arg(long)]
    interface: Option<Ipv4Addr>,

    #[arg(long, default_value_t = multicast::DEFAULT_GROUP)]
    group: Ipv4Addr,

    #[arg(long, value_enum, default_value_t = AnycastArg::Cloudflare)]
    target: AnycastArg,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Subcommand)]
enum UpnpCommand {
    /// Add a port mapping
    Add {
        #[arg(long)]
        external_port: u16,
        #[arg(long)]
        internal_port: u16,
        /// Defaults to the local IPv4
        #[arg(long)]
        internal_client: Option<Ipv4Addr>,
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,
        #[arg(long, default_value = env!("CARGO_PKG_NAME"))]
        description: String,
    },
    /// Delete a port mapping
    Delete {
        #[arg(long)]
        external_port: u16,
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .parse_default_env()
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(e) => {
            eprintln!("{} {}", "Error:".bold().red(), e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Monitor(args) => monitor(args).await,
        Command::UnicastPing { host } => unicast_ping(&host).await,
        Command::Packet(args) => packet(args).await,
        Command::Upnp(command) => upnp(command).await,
        Command::Traceroute { host } => tools::traceroute(&host, |line| println!("{}", line)).await,
        Command::Netstat => tools::netstat(|line| println!("{}", line)).await,
        Command::LanScan { interface } => {
            let interface = match interface {
                Some(ip) => ip,
                None => net::local_ipv4().await?,
            };
            tools::lan_scan(interface, |line| println!("{}", line)).await;
            Ok(())
        }
    }
}

fn event_sink() -> (Arc<dyn MonitorSink>, UnboundedReceiver<MonitorEvent>) {
    let (channel, rx) = ChannelSink::new();
    let sink = FanoutSink::new()
        .with(Arc::new(channel))
        .with(Arc::new(LogSink));
    (Arc::new(sink), rx)
}

async fn monitor(args: MonitorArgs) -> Result<()> {
    let settings = args.settings();
    settings.validate()?;

    let interface = match &args.interface {
        Some(label) => label.clone(),
        None => net::local_ipv4().await?.to_string(),
    };

    let (sink, mut events) = event_sink();
    let scheduler = MonitorScheduler::new(ProbeSet::system()?, SettingsHandle::new(settings), sink)
        .with_csv_log(CsvLog::open(&args.csv)?);

    scheduler.start(interface, args.interval)?;

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(MonitorEvent::Measurement(m)) => {
                    print_measurement(&m);
                    seen += 1;
                    if args.count.is_some_and(|count| seen >= count) {
                        break;
                    }
                }
                Some(MonitorEvent::LogLine(line)) => debug!("{}", line),
                Some(MonitorEvent::PacketSample { .. }) => {}
                None => break,
            },
        }
    }

    scheduler.shutdown().await;

    if let Some(path) = &args.json {
        export_json(path, &scheduler.history().snapshot())?;
        println!("{} {}", "Exported:".bold().white(), path.display());
    }

    Ok(())
}

fn print_measurement(m: &Measurement) {
    println!(
        "{} {} | {} {} | {} {} | {} {} | {} {} | {} {} | {} {}",
        m.timestamp.format("%H:%M:%S").to_string().dimmed(),
        m.interface.bright_blue(),
        "DL:".bold().white(),
        format!("{:.2} Mbps", m.download_mbps).bright_cyan(),
        "UL:".bold().white(),
        format!("{:.2} Mbps", m.upload_mbps).bright_cyan(),
        "Ping:".bold().white(),
        format!("{:.2} ms", m.ping_avg_ms),
        "Jitter:".bold().white(),
        format!("{:.2} ms", m.jitter_ms),
        "Loss:".bold().white(),
        format!("{:.2} %", m.packet_loss_percent),
        "HTTP:".bold().white(),
        format!("{:.2} ms", m.http_response_ms),
    );
}

async fn unicast_ping(host: &str) -> Result<()> {
    let (sink, _events) = event_sink();
    let engine = PacketTestEngine::new(ProbeSet::system()?, sink);

    match engine.ping_once(host).await {
        LatencySample::Reply(rtt) => {
            println!(
                "{} {} {}",
                "Ping".bold().white(),
                host.bright_blue(),
                format!("{:.2} ms", rtt.as_secs_f64() * 1000.0).bright_cyan()
            );
            Ok(())
        }
        LatencySample::NoResponse => Err(MonitorError::network(format!(
            "no reply from {}",
            host
        ))),
    }
}

async fn packet_target(args: &PacketArgs) -> Result<PacketTarget> {
    Ok(match args.mode {
        ModeArg::Unicast => PacketTarget::Unicast(UnicastTarget::new(
            args.host.clone(),
            args.port.unwrap_or(unicast::DEFAULT_PORT),
        )),
        ModeArg::Broadcast => {
            let interface = match args.interface {
                Some(ip) => ip,
                None => net::local_ipv4().await?,
            };
            let mut target = BroadcastTarget::for_interface(interface);
            target.destination.set_port(args.port.unwrap_or(broadcast::DEFAULT_PORT));
            PacketTarget::Broadcast(target)
        }
        ModeArg::Multicast => PacketTarget::Multicast(MulticastTarget {
            group: args.group,
            port: args.port.unwrap_or(multicast::DEFAULT_PORT),
            interface: args.interface.unwrap_or(Ipv4Addr::UNSPECIFIED),
            loopback: false,
        }),
        ModeArg::Anycast => PacketTarget::Anycast(match args.target {
            AnycastArg::Cloudflare => AnycastTarget::cloudflare(),
            AnycastArg::Google => AnycastTarget::google(),
        }),
    })
}

async fn packet(args: PacketArgs) -> Result<()> {
    let target = packet_target(&args).await?;
    let mode = target.mode();

    let (sink, mut events) = event_sink();
    let engine = PacketTestEngine::new(ProbeSet::system()?, sink);

    engine.start(target).await;

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(MonitorEvent::PacketSample { mode, value_ms }) => {
                    let value = if value_ms > 0.0 {
                        format!("{:.2} ms", value_ms).bright_cyan()
                    } else {
                        "no reply".yellow()
                    };
                    println!("{} {}", format!("[{}]", mode).bold().white(), value);
                }
                Some(MonitorEvent::LogLine(line)) => debug!("{}", line),
                Some(MonitorEvent::Measurement(_)) => {}
                None => break,
            },
        }
    }

    engine.stop_all().await;
    print_series_summary(mode, &engine.series(mode));

    Ok(())
}

fn print_series_summary(mode: PacketTestMode, series: &[f64]) {
    let replies: Vec<f64> = series.iter().copied().filter(|v| *v > 0.0).collect();

    println!(
        "{} {} samples, {} answered",
        format!("{} summary:", mode).bold().white(),
        series.len(),
        replies.len()
    );
    if let (Some(min), Some(avg)) = (stats::minimum(&replies), stats::mean(&replies)) {
        println!(
            "  min {} | avg {} | jitter {}",
            format!("{:.2} ms", min).bright_cyan(),
            format!("{:.2} ms", avg).bright_cyan(),
            format!("{:.2} ms", stats::population_std_dev(&replies).unwrap_or(0.0)).bright_cyan()
        );
    }
}

async fn upnp(command: UpnpCommand) -> Result<()> {
    let action = match command {
        UpnpCommand::Add {
            external_port,
            internal_port,
            internal_client,
            protocol,
            description,
        } => {
            let internal_client = match internal_client {
                Some(ip) => ip,
                None => net::local_ipv4().await?,
            };
            PortMappingAction::Add(PortMapping {
                external_port,
                protocol,
                internal_port,
                internal_client,
                description,
            })
        }
        UpnpCommand::Delete { external_port, protocol } => {
            PortMappingAction::Delete { external_port, protocol }
        }
    };

    let report = UpnpController::system()?.run(&action).await;

    for line in &report.transcript {
        println!("{}", line);
    }

    match report.outcome {
        Ok(_) => {
            println!("{} {}", report.action.bold().white(), "succeeded".green());
            Ok(())
        }
        Err(failure) => Err(failure.into()),
    }
}
