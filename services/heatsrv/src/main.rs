use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::service_bootstrap::print_startup_banner;
use heatsrv::bootstrap::{self, Args, Command};
use heatsrv::config::AppConfig;
use heatsrv::gateway::ElsterGateway;
use heatsrv::publisher::{MessageTransport, PublishQueue, PublisherSettings, RumqttcTransport};
use heatsrv::service::HeatingService;
use heatsrv::transport::{FrameTransport, SlcanTransport};

struct Bus {
    transport: Arc<SlcanTransport>,
    gateway: Arc<ElsterGateway>,
    pump: JoinHandle<()>,
}

impl Bus {
    async fn open(config: &AppConfig, cancel: &CancellationToken) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.can.channel_capacity);
        let transport = Arc::new(
            SlcanTransport::open(config.can.slcan(), tx, cancel.clone())
                .await
                .with_context(|| format!("Failed to open CAN adapter on {}", config.can.port))?,
        );

        let frame_transport: Arc<dyn FrameTransport> = transport.clone();
        let gateway = Arc::new(ElsterGateway::new(
            frame_transport,
            config.can.sender_id,
            &config.elster,
        ));
        let pump = gateway.spawn_frame_pump(rx, cancel.clone());

        Ok(Self {
            transport,
            gateway,
            pump,
        })
    }

    async fn close(self) {
        self.transport.close().await;
        if let Err(e) = self.pump.await {
            warn!("Frame pump ended abnormally: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = bootstrap::load_config(&args).context("Failed to load configuration")?;

    let command = args.command();
    if command == Command::Config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    bootstrap::initialize_logging(&args, &config)?;

    if args.validate {
        bootstrap::describe_configuration(&config);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn(common::shutdown::cancel_on_shutdown(cancel.clone()));

    match command {
        Command::Run | Command::Config => {
            #[cfg(unix)]
            tokio::spawn(bootstrap::reload_log_level_on_hangup(
                args.clone(),
                cancel.clone(),
            ));
            run(config, cancel).await
        },
        Command::Read {
            receiver,
            index,
            sender,
        } => read(config, cancel, receiver, index, sender).await,
        Command::Scan { sender, from, to } => scan(config, cancel, sender, from, to).await,
        Command::Sniff { seconds, json } => sniff(config, cancel, seconds, json).await,
    }
}

async fn run(config: AppConfig, cancel: CancellationToken) -> Result<()> {
    print_startup_banner(&bootstrap::service_info());

    let bus = Bus::open(&config, &cancel).await?;

    let mqtt: Arc<dyn MessageTransport> = Arc::new(
        RumqttcTransport::new(config.mqtt.clone()).context("Invalid MQTT configuration")?,
    );
    let publisher = PublishQueue::new(mqtt, PublisherSettings::from_config(&config.mqtt), &cancel);
    publisher.start();

    let service = Arc::new(HeatingService::new(
        Arc::clone(&bus.gateway),
        Arc::clone(&publisher),
        config.polling.clone(),
        config.elster.passive_report_interval(),
    ));
    let tasks = service.spawn(&cancel);

    info!("heatsrv running, press Ctrl+C to stop");
    cancel.cancelled().await;

    info!("Shutting down");
    publisher.shutdown().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Service task ended abnormally: {}", e);
        }
    }
    bus.close().await;
    info!("heatsrv stopped");
    Ok(())
}

async fn read(
    config: AppConfig,
    cancel: CancellationToken,
    receiver: u16,
    index: u16,
    sender: Option<u16>,
) -> Result<()> {
    let bus = Bus::open(&config, &cancel).await?;
    let sender = sender.unwrap_or(config.can.sender_id);

    let result = bus
        .gateway
        .request_value_as(sender, receiver, index, config.elster.request_timeout())
        .await;
    cancel.cancel();
    bus.close().await;

    let value = result?;
    println!(
        "0x{:03x} {} (0x{:04x}) = {} [raw 0x{:04x}]",
        receiver,
        value.name(),
        index,
        value,
        value.raw_u16()
    );
    Ok(())
}

async fn scan(
    config: AppConfig,
    cancel: CancellationToken,
    sender: Option<u16>,
    from: Option<u16>,
    to: Option<u16>,
) -> Result<()> {
    let bus = Bus::open(&config, &cancel).await?;

    let found = match (from, to) {
        (Some(from), Some(to)) => bus.gateway.scan_receivers(sender, from..=to).await,
        _ => bus.gateway.scan_modules(sender).await,
    };
    cancel.cancel();
    bus.close().await;

    for receiver in found {
        println!("0x{:03x}", receiver);
    }
    Ok(())
}

async fn sniff(config: AppConfig, cancel: CancellationToken, seconds: u64, json: bool) -> Result<()> {
    let bus = Bus::open(&config, &cancel).await?;

    info!("Capturing telegrams for {}s", seconds);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {},
        _ = cancel.cancelled() => {},
    }

    let telegrams = bus.gateway.list_passive_telegrams();
    cancel.cancel();
    bus.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&telegrams)?);
    } else {
        for telegram in &telegrams {
            println!("{}", telegram);
        }
        println!("{} telegram(s)", telegrams.len());
    }
    Ok(())
}
