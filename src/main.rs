use anyhow::Context;
use aoa_gateway::domain::locators::LocatorRegistry;
use aoa_gateway::domain::settings::{Settings, SettingsService};
use aoa_gateway::estimation::{EstimatorFactory, ReferenceEstimators};
use aoa_gateway::infrastructure::bluetooth::protocol::{RadioCommand, RadioEvent};
use aoa_gateway::infrastructure::bluetooth::{GatewayConfig, GatewayService};
use aoa_gateway::infrastructure::logging::init_logger;
use aoa_gateway::infrastructure::publish::{Publication, Publisher};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const REAP_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let mut settings_service = SettingsService::new(path)?;

    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    settings_service.validate()?;

    info!(
        "Starting AoA gateway with settings from {}",
        settings_service.path().display()
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(run(settings_service.get().clone()))
}

async fn write_commands(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<RadioCommand>,
) -> anyhow::Result<()> {
    while let Some(command) = commands.recv().await {
        let mut line = serde_json::to_vec(&command)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
    }
    Ok(())
}

async fn write_publications(
    mut publications: mpsc::UnboundedReceiver<Publication>,
) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(publication) = publications.recv().await {
        stdout
            .write_all(format!("{}\n", publication).as_bytes())
            .await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let factory: Rc<dyn EstimatorFactory> = Rc::new(ReferenceEstimators::new(
        settings.array_type,
        settings.azimuth_mask,
        settings.interferometer.clone(),
    ));
    // Fail at startup rather than on the first tag
    factory
        .angle_estimator()
        .context("Angle estimator initialization failed")?;
    factory
        .position_estimator()
        .context("Position estimator initialization failed")?;

    let stream = TcpStream::connect(&settings.radio_address)
        .await
        .with_context(|| format!("Failed to connect to radio at {}", settings.radio_address))?;
    info!("Connected to radio at {}", settings.radio_address);
    let (reader, writer) = stream.into_split();

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (publication_tx, publication_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Err(e) = write_commands(writer, command_rx).await {
            error!("Radio writer stopped: {}", e);
        }
    });
    tokio::spawn(async move {
        if let Err(e) = write_publications(publication_rx).await {
            error!("Publication writer stopped: {}", e);
        }
    });

    let mut gateway = GatewayService::new(
        GatewayConfig::from_settings(&settings),
        LocatorRegistry::from_config(&settings.locators),
        factory,
        command_tx.clone(),
        Publisher::new(publication_tx),
    );

    // The radio answers with a boot event
    command_tx
        .send(RadioCommand::SystemReset)
        .context("Radio writer closed")?;

    let mut lines = BufReader::new(reader).lines();
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from radio")? else {
                    warn!("Radio closed the connection");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RadioEvent>(&line) {
                    Ok(event) => gateway.handle_event(event, Instant::now())?,
                    Err(e) => warn!("Unrecognized radio event: {}", e),
                }
            }
            _ = reap.tick() => {
                gateway.reap_stalled(Instant::now())?;
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    info!(
        "Gateway stopped with {} connections and {} tracked tags",
        gateway.connections().len(),
        gateway.aggregator().tag_count()
    );
    Ok(())
}
