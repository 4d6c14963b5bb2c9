use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloudless::{
    bridge::Bridge,
    broker,
    certs::{CertificateIssuer, OpensslIssuer},
    config::{self, Config},
    devman::DeviceManager,
    legacy::LegacyManager,
    setup::{self, WifiCredentials},
    tlv,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG: &str = "./config.json";

#[derive(Parser, Debug)]
#[command()]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run broker, device managers and hub bridge
    Run {
        #[clap(long)]
        #[arg(default_value_t = DEFAULT_CONFIG.to_string())]
        config: String,
    },
    /// Print registers of hex encoded tlv data
    DecodeTlv { hex: String },
    /// Sign device certificate request with the local CA
    SignCsr {
        #[clap(long)]
        #[arg(default_value_t = DEFAULT_CONFIG.to_string())]
        config: String,

        file: String,
    },
    /// Send Wi-Fi credentials to appliance in setup mode
    Setup {
        /// Appliance address on its access point
        #[clap(long)]
        #[arg(default_value_t = String::from("192.168.120.254"))]
        host: String,

        ssid: String,
        password: String,
    },
}

fn init_logging(filter: &str) {
    let mut builder = env_logger::Builder::new();
    if std::env::var_os("RUST_LOG").is_some() {
        builder.parse_default_env();
    } else {
        builder.parse_filters(filter);
    }
    builder
        .target(env_logger::Target::Stdout)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();
}

async fn run(config: Config) -> Result<()> {
    let issuer = OpensslIssuer::new(&config.ca_cert_file, &config.ca_key_file);
    if let Err(e) = issuer.ensure_ca(&config.hostname).await {
        log::warn!(target: "status", "no CA available: {:#}", e);
    }

    let cancel = CancellationToken::new();
    let broker = broker::start(config.broker.limits(), cancel.clone());

    let (devices, clip_devices) = DeviceManager::new(broker.clone(), config.topics.clone(), config.device_queue);
    tokio::spawn(devices.run(broker.observe().await?, cancel.clone()));

    let bridge = Bridge::connect(&broker, config.hub.clone()).await?;
    bridge.add_source(clip_devices);

    if let Some(port) = config.legacy.port {
        let (legacy, legacy_devices) = LegacyManager::new(config.legacy.clone(), config.device_queue);
        bridge.add_source(legacy_devices);
        let listener = TcpListener::bind((config.broker.bind.as_str(), port))
            .await
            .context(format!("binding legacy port {}", port))?;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = legacy.serve(listener, cancel).await {
                log::error!(target: "status", "legacy listener failed: {:#}", e);
            }
        });
    }

    let listener = TcpListener::bind((config.broker.bind.as_str(), config.broker.port))
        .await
        .context(format!("binding broker port {}", config.broker.port))?;
    let server = tokio::spawn(broker::server::serve(listener, broker.clone(), cancel.clone()));

    // stopped before the broker so it can still announce going offline
    let bridge_cancel = CancellationToken::new();
    let bridge = tokio::spawn(bridge.run(bridge_cancel.clone()));

    log::info!(target: "status", "cloudless ready on port {}", config.broker.port);
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.context("waiting for ctrl-c")?,
        r = server => r.context("broker server task")??,
    }

    bridge_cancel.cancel();
    if let Err(e) = bridge.await.context("bridge task")? {
        log::warn!(target: "status", "bridge shutdown: {:#}", e);
    }
    cancel.cancel();
    Ok(())
}

fn decode_tlv(data: &str) -> Result<()> {
    let data = hex::decode(data.trim()).context("tlv data is not hex")?;
    for t in tlv::parse(&data) {
        println!("0x{:03x} = {} (0x{:x})", t.tag, t.value, t.value);
    }
    Ok(())
}

async fn sign_csr(config: &Config, file: &str) -> Result<()> {
    let csr = std::fs::read_to_string(file).context(format!("reading {}", file))?;
    let issuer = OpensslIssuer::new(&config.ca_cert_file, &config.ca_key_file);
    let pem = issuer.issue(&csr).await?;
    print!("{}", pem);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating runtime")?;

    match cli.command {
        Commands::Run { config } => {
            let config = config::load_config(&config)?;
            init_logging(&config.log_filter());
            runtime.block_on(run(config))
        }
        Commands::DecodeTlv { hex } => {
            init_logging("warn");
            decode_tlv(&hex)
        }
        Commands::SignCsr { config, file } => {
            init_logging("warn");
            let config = config::load_config(&config)?;
            runtime.block_on(sign_csr(&config, &file))
        }
        Commands::Setup { host, ssid, password } => {
            init_logging("info");
            runtime.block_on(setup::run(&host, &WifiCredentials { ssid, password }))
        }
    }
}
