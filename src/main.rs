//! kport CLI - forward a remote TCP service to localhost over SSH

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info};

use kport::config::{HostDescriptor, HostInventory, Settings, SettingsStorage, TransportKind};
use kport::discovery::PortDiscovery;
use kport::forwarding::{
    ControllerHandle, ForwardController, ForwardEvent, ForwardEventEmitter, PortRequest,
};
use kport::transport::{factory_for, HostTransport, TransportFactory};

/// Expected output of the connection self-test command
const CONNECTION_TEST_OUTPUT: &str = "connection test";

#[derive(Parser, Debug)]
#[command(name = "kport")]
#[command(about = "Forward a remote TCP service to localhost over SSH", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SSH config file to read hosts from (default: ~/.ssh/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tunnel transport: native (built-in SSH) or process (system ssh)
    #[arg(long, global = true, env = "KPORT_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List hosts from the SSH config
    Hosts,
    /// Show which ports a host is listening on
    Discover {
        /// Host alias from the SSH config
        host: String,
    },
    /// Forward a remote port to localhost until Ctrl-C
    Forward {
        /// Host alias from the SSH config
        host: String,
        /// Remote port; the first discovered port when omitted
        port: Option<String>,
    },
    /// Check that a host is reachable and discovery works
    TestConnect {
        /// Host alias from the SSH config
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    kport::init_logging(cli.verbose);

    let mut settings = load_settings().await?;
    if let Some(transport) = cli.transport {
        settings.transport = transport;
    }
    debug!("Settings: {:?}", settings);

    let inventory = HostInventory::load(cli.config.clone())
        .await
        .context("Failed to load SSH config")?;

    match cli.command {
        Commands::Hosts => {
            list_hosts(&inventory);
            Ok(())
        }
        Commands::Discover { host } => discover(&settings, inventory, &host).await,
        Commands::Forward { host, port } => forward(&settings, inventory, &host, port).await,
        Commands::TestConnect { host } => test_connect(&settings, &inventory, &host).await,
    }
}

async fn load_settings() -> Result<Settings> {
    let storage = SettingsStorage::new().context("Failed to locate settings")?;
    let mut settings = storage
        .load()
        .await
        .with_context(|| format!("Failed to read {}", storage.path().display()))?;
    settings
        .apply_env()
        .context("Invalid transport in environment")?;
    Ok(settings)
}

fn list_hosts(inventory: &HostInventory) {
    let hosts = inventory.descriptors();
    if hosts.is_empty() {
        println!("No hosts found. Add Host entries to ~/.ssh/config.");
        return;
    }

    for host in hosts {
        print!("{:<20} {}@{}:{}", host.name, host.user, host.address, host.port);
        if let Some(identity) = &host.identity {
            print!("  ({})", identity);
        }
        println!();
    }
}

struct Controller {
    handle: ControllerHandle,
    events: mpsc::UnboundedReceiver<ForwardEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl Controller {
    fn spawn(settings: &Settings, inventory: HostInventory) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let controller = ForwardController::new(
            settings,
            inventory,
            factory_for(settings),
            ForwardEventEmitter::new(tx),
        )
        .context("Invalid settings")?;
        let (handle, task) = controller.spawn();
        Ok(Self {
            handle,
            events,
            task,
        })
    }

    async fn next_event(&mut self) -> Result<ForwardEvent> {
        self.events
            .recv()
            .await
            .context("Controller stopped unexpectedly")
    }

    async fn discover(&mut self, host: &str) -> Result<Vec<u16>> {
        self.handle.discover(host).await;
        loop {
            if let ForwardEvent::Discovered { ports, .. } = self.next_event().await? {
                return Ok(ports);
            }
        }
    }

    async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await;
        self.task.await.context("Controller task failed")
    }
}

async fn discover(settings: &Settings, inventory: HostInventory, host: &str) -> Result<()> {
    inventory.get_host_by_name(host)?;

    let mut controller = Controller::spawn(settings, inventory)?;
    let ports = controller.discover(host).await?;
    controller.shutdown().await?;

    if ports.is_empty() {
        println!("No listening ports found on {}.", host);
        println!("You can still forward a port by number: kport forward {} <port>", host);
    } else {
        println!("Listening ports on {}:", host);
        for port in ports {
            println!("  {}", port);
        }
    }
    Ok(())
}

async fn forward(
    settings: &Settings,
    inventory: HostInventory,
    host: &str,
    port: Option<String>,
) -> Result<()> {
    inventory.get_host_by_name(host)?;

    let mut controller = Controller::spawn(settings, inventory)?;

    let request = match port {
        Some(text) => PortRequest::Manual(text),
        None => {
            let ports = controller.discover(host).await?;
            let Some(&first) = ports.first() else {
                controller.shutdown().await?;
                bail!("No listening ports found on {}; pass a port explicitly", host);
            };
            println!("Discovered ports on {}: {:?}, forwarding {}", host, ports, first);
            PortRequest::Number(first)
        }
    };

    controller.handle.start_forward(host, request).await;

    let session_id = loop {
        match controller.next_event().await? {
            ForwardEvent::ForwardingStarted {
                session_id,
                local_port,
                remote_port,
                same_port,
                ..
            } => {
                println!(
                    "Forwarding localhost:{} -> {}:{}{}",
                    local_port,
                    host,
                    remote_port,
                    if same_port { "" } else { " (remote port was busy locally)" }
                );
                println!("Press Ctrl-C to stop.");
                break session_id;
            }
            ForwardEvent::Error { reason } => {
                controller.shutdown().await?;
                bail!("Failed to start forwarding: {}", reason);
            }
            other => debug!("Ignoring event {:?}", other),
        }
    };

    let lost = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, stopping");
            controller.handle.stop(session_id.clone()).await;
            None
        }
        event = wait_for_stop(&mut controller, &session_id) => Some(event?),
    };

    if let Some(reason) = lost {
        controller.shutdown().await?;
        bail!("Forwarding stopped: {}", reason);
    }

    // Wait for the drain to finish before exiting
    wait_for_stop(&mut controller, &session_id).await?;
    controller.shutdown().await?;
    println!("Stopped.");
    Ok(())
}

/// Wait for `SessionStopped` of `session_id`, returning its reason
async fn wait_for_stop(controller: &mut Controller, session_id: &str) -> Result<String> {
    loop {
        if let ForwardEvent::SessionStopped {
            session_id: stopped,
            reason,
        } = controller.next_event().await?
        {
            if stopped == session_id {
                return Ok(reason.unwrap_or_else(|| "stopped".to_string()));
            }
        }
    }
}

async fn test_connect(settings: &Settings, inventory: &HostInventory, name: &str) -> Result<()> {
    println!("Testing connection to host: {}", name);
    println!("=====================================");

    let Some(raw) = inventory.find(name) else {
        bail!("Host '{}' not found", name);
    };
    let host = raw.to_descriptor();

    println!("Found host configuration:");
    println!("  Name: {}", raw.alias);
    println!("  Hostname: {}", raw.effective_hostname());
    println!("  User: {}", raw.user.as_deref().unwrap_or("(local user)"));
    println!("  Port: {}", raw.effective_port());
    if let Some(identity) = &raw.identity_file {
        println!("  Identity: {}", identity);
    }
    println!();

    let mut expanded = false;
    if let Some(user) = raw.user.as_deref().filter(|user| *user != host.user) {
        println!("Expanded user: {} -> {}", user, host.user);
        expanded = true;
    }
    if let (Some(before), Some(after)) = (&raw.identity_file, &host.identity) {
        if before != after {
            println!("Expanded identity: {} -> {}", before, after);
            expanded = true;
        }
    }
    if expanded {
        println!();
    }

    println!("Testing SSH connection ({:?} transport)...", settings.transport);
    let factory = factory_for(settings);
    let connection = match connect_and_echo(factory.as_ref(), &host).await {
        Ok((connection, output)) => {
            if output.trim() == CONNECTION_TEST_OUTPUT {
                println!("SSH connection successful!");
            } else {
                println!(
                    "SSH connection partially successful but got unexpected output: {}",
                    output
                );
            }
            connection
        }
        Err(e) => {
            println!("SSH connection failed: {:#}", e);
            println!();
            println!("Common SSH connection issues:");
            println!("- SSH keys not set up or not in SSH agent");
            println!("- Wrong username or hostname");
            println!("- Host key verification failed");
            println!("- SSH server not running or configured differently");
            println!("- ProxyCommand or other SSH config issues");
            println!();
            println!("Try running the SSH command manually:");
            println!("  ssh {}", name);
            return Ok(());
        }
    };
    println!();

    println!("Testing port detection...");
    let ports = PortDiscovery::new(settings)
        .discover(connection.runner.as_ref(), connection.transport.as_ref())
        .await;
    if ports.is_empty() {
        println!("No listening ports detected.");
    } else {
        println!("Port detection successful! Found {} ports: {:?}", ports.len(), ports);
    }
    println!();
    println!("You can still forward a port by number even if port detection finds nothing.");
    Ok(())
}

async fn connect_and_echo(
    factory: &dyn TransportFactory,
    host: &HostDescriptor,
) -> Result<(HostTransport, String)> {
    let connection = factory.connect(host).await?;
    let output = tokio::time::timeout(
        Duration::from_secs(30),
        connection
            .runner
            .execute(&format!("echo '{}'", CONNECTION_TEST_OUTPUT)),
    )
    .await
    .context("Timed out running the test command")??;
    let output = String::from_utf8_lossy(&output).into_owned();
    Ok((connection, output))
}
