//! Command-line interface for ExtIoT.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use extiot_core::config::{defaults, env_flag, env_vars};
use extiot_core::{
    DeviceKey, DeviceProfile, Envelope, MessageType, MqttConfig, Payload, QoS, SnowflakeGenerator,
    TopicKind, TopicScheme,
};
use extiot_devices::{
    DeviceAgent, DeviceService, MqttTransport, RegistryConfig, SchedulerConfig, SimulatedSensor,
    Transport,
};
use extiot_storage::{DeviceStore, MemoryDeviceStore, RedbDeviceStore};

/// Time given to the MQTT event loop to flush a one-shot publish.
const FLUSH_DELAY: Duration = Duration::from_secs(1);

/// ExtIoT - device identity and reporting over MQTT.
#[derive(Parser, Debug)]
#[command(name = "extiot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Broker address (`host`, `host:port` or `tcp://host:port`).
    #[arg(long, global = true, env = env_vars::BROKER, default_value = defaults::BROKER_HOST)]
    broker: String,

    /// Broker port, overriding any port in `--broker`.
    #[arg(long, global = true, env = env_vars::PORT)]
    port: Option<u16>,

    /// Broker username.
    #[arg(long, global = true, env = env_vars::USER)]
    user: Option<String>,

    /// Broker password.
    #[arg(long, global = true, env = env_vars::PASSWORD, hide_env_values = true)]
    password: Option<String>,

    /// Topic prefix shared by the service and its devices.
    #[arg(long, global = true, env = env_vars::TOPIC_PREFIX, default_value = extiot_core::config::topics::DEFAULT_PREFIX)]
    topic_prefix: String,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the device service.
    Serve {
        /// Identity generator node id, unique per running service (0-1023).
        #[arg(long, env = env_vars::NODE_ID, default_value_t = defaults::NODE_ID)]
        node_id: u16,
        /// Device database file. Devices are kept in memory when omitted.
        #[arg(long, env = env_vars::DB_PATH)]
        db: Option<PathBuf>,
        /// MQTT client id.
        #[arg(long, default_value = defaults::SERVER_CLIENT_ID)]
        client_id: String,
        /// Capacity of the inbound message queue.
        #[arg(long, default_value_t = defaults::INBOUND_CAPACITY)]
        inbound_capacity: usize,
        /// Seconds before a device store call is abandoned.
        #[arg(long, default_value_t = defaults::STORE_TIMEOUT_SECS)]
        store_timeout: u64,
        /// Seconds before a publish to a device is abandoned.
        #[arg(long, default_value_t = defaults::PUBLISH_TIMEOUT_SECS)]
        publish_timeout: u64,
    },
    /// Run a simulated device.
    Device {
        /// Device profile (ProductType, ProductId, SN, MAC).
        #[arg(short, long, default_value = "./config.json")]
        config: PathBuf,
        /// Reporting interval until the service sends another one.
        #[arg(long, default_value_t = defaults::REPORT_INTERVAL_SECS)]
        interval: u64,
    },
    /// Print the status reports of one device.
    Monit {
        /// Device token, `{ProductId}_{SN}`.
        #[arg(required = true)]
        device: String,
    },
    /// Push a config object to one device.
    Config {
        /// Device token, `{ProductId}_{SN}`.
        #[arg(required = true)]
        device: String,
        /// JSON object, e.g. '{"interval": 10}'.
        #[arg(required = true)]
        settings: String,
    },
}

impl Args {
    fn mqtt_config(&self, client_id: impl Into<String>) -> Result<MqttConfig> {
        let (host, port) = MqttConfig::parse_broker(&self.broker)?;
        let mut config = MqttConfig::new(host, client_id).with_port(self.port.unwrap_or(port));
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            config = config.with_auth(user.clone(), password.clone());
        }
        Ok(config)
    }

    fn topics(&self) -> TopicScheme {
        TopicScheme::new(self.topic_prefix.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Check if JSON logging is requested (for production/container environments)
    let json_logging = env_flag(env_vars::LOG_JSON);

    let default_filter = if args.verbose { "extiot=debug" } else { "extiot=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        }
    });

    match &args.command {
        Command::Serve {
            node_id,
            db,
            client_id,
            inbound_capacity,
            store_timeout,
            publish_timeout,
        } => {
            let mqtt = args
                .mqtt_config(client_id.clone())?
                .with_inbound_capacity(*inbound_capacity);
            let registry = RegistryConfig {
                store_timeout: Duration::from_secs(*store_timeout),
                publish_timeout: Duration::from_secs(*publish_timeout),
                ..RegistryConfig::default()
            };
            run_serve(&args, mqtt, *node_id, db.clone(), registry, shutdown).await
        }
        Command::Device { config, interval } => {
            run_device(&args, config, *interval, shutdown).await
        }
        Command::Monit { device } => run_monit(&args, device, shutdown).await,
        Command::Config { device, settings } => run_config(&args, device, settings).await,
    }
}

async fn run_serve(
    args: &Args,
    mqtt: MqttConfig,
    node_id: u16,
    db: Option<PathBuf>,
    registry: RegistryConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let store: Arc<dyn DeviceStore> = match &db {
        Some(path) => Arc::new(
            RedbDeviceStore::open(path)
                .with_context(|| format!("failed to open device database {}", path.display()))?,
        ),
        None => {
            warn!("No --db given, registrations are lost on restart");
            Arc::new(MemoryDeviceStore::new())
        }
    };
    let generator = SnowflakeGenerator::new(node_id)?;

    let (transport, inbound) = MqttTransport::connect(&mqtt, shutdown.clone());
    let service = DeviceService::builder()
        .transport(transport.clone())
        .store(store)
        .generator(Arc::new(generator))
        .topics(args.topics())
        .registry_config(registry)
        .build()?;

    info!(broker = %transport.broker_addr(), node_id, "Device service running");
    let stats = service.run(inbound, shutdown).await?;
    info!(handled = stats.handled, failed = stats.failed, "Device service stopped");
    let _ = transport.disconnect().await;
    Ok(())
}

async fn run_device(
    args: &Args,
    config: &Path,
    interval: u64,
    shutdown: CancellationToken,
) -> Result<()> {
    let profile = DeviceProfile::from_file(config)?;
    let key = profile.key();
    let mqtt = args.mqtt_config(key.token())?;

    let (transport, inbound) = MqttTransport::connect(&mqtt, shutdown.clone());
    let agent = Arc::new(DeviceAgent::new(
        profile,
        transport.clone(),
        Arc::new(SimulatedSensor::default()),
        args.topics(),
        SchedulerConfig {
            initial_interval: Duration::from_secs(interval),
            ..SchedulerConfig::default()
        },
    ));

    info!(device = %key, broker = %transport.broker_addr(), "Simulated device running");
    agent.run(inbound, shutdown).await?;
    let _ = transport.disconnect().await;
    Ok(())
}

async fn run_monit(args: &Args, device: &str, shutdown: CancellationToken) -> Result<()> {
    let topic = args.topics().for_token(TopicKind::Data, device);
    let mqtt = args
        .mqtt_config(format!("monit-{}", uuid::Uuid::new_v4().simple()))?
        .with_clean_session(true);

    let (transport, mut inbound) = MqttTransport::connect(&mqtt, shutdown.clone());
    transport.subscribe(&topic, QoS::AtMostOnce).await?;
    info!(topic = %topic, "Watching device reports");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = inbound.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        match Envelope::decode(&delivery.payload) {
            Ok(envelope) => info!(
                topic = %delivery.topic,
                message_type = %envelope.message_type,
                device_id = ?envelope.identity().map(|id| id.value()),
                payload = %serde_json::Value::Object(envelope.payload),
                "Report"
            ),
            Err(_) => info!(
                topic = %delivery.topic,
                raw = %String::from_utf8_lossy(&delivery.payload),
                "Report"
            ),
        }
    }

    let _ = transport.disconnect().await;
    Ok(())
}

async fn run_config(args: &Args, device: &str, settings: &str) -> Result<()> {
    let key = parse_device_token(device)?;
    let settings = parse_settings(settings)?;
    let topic = args.topics().config(&key);
    let envelope = Envelope::new(MessageType::Config, &key).with_payload(settings);

    let shutdown = CancellationToken::new();
    let mqtt = args
        .mqtt_config(format!("config-{}", uuid::Uuid::new_v4().simple()))?
        .with_clean_session(true);
    let (transport, _inbound) = MqttTransport::connect(&mqtt, shutdown.clone());
    transport
        .publish(&topic, QoS::AtLeastOnce, envelope.encode())
        .await?;
    info!(topic = %topic, "Config sent");

    tokio::time::sleep(FLUSH_DELAY).await;
    let _ = transport.disconnect().await;
    shutdown.cancel();
    Ok(())
}

/// Split a `{ProductId}_{SN}` token at its first underscore.
fn parse_device_token(token: &str) -> Result<DeviceKey> {
    match token.split_once('_') {
        Some((product_id, serial)) if !product_id.is_empty() && !serial.is_empty() => {
            Ok(DeviceKey::new(product_id, serial))
        }
        _ => bail!("device must be given as {{ProductId}}_{{SN}}, got '{}'", token),
    }
}

fn parse_settings(raw: &str) -> Result<Payload> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("settings are not valid JSON")?;
    match value {
        serde_json::Value::Object(settings) => Ok(settings),
        other => bail!("settings must be a JSON object, got {}", other),
    }
}
