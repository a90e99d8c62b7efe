use clap::{Parser, Subcommand};
use lanlink::core::config::{DEFAULT_DISCOVERY_PORT, DEFAULT_TRANSFER_PORT};
use lanlink::{
    Config, DiscoveryService, FileIo, NativePlatform, SocketEngine, TransferManager,
    TransferStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[derive(Parser)]
#[command(name = "lanlink")]
#[command(about = "Peer-to-peer LAN file transfer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Display name advertised to other peers
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// TCP port for transfers
    #[arg(long, global = true, default_value_t = DEFAULT_TRANSFER_PORT)]
    transfer_port: u16,

    /// UDP discovery port (the default maps to a random high port)
    #[arg(long, global = true, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Password for end-to-end encryption
    #[arg(long, global = true)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node that accepts incoming files
    Start {
        /// Directory for received files
        #[arg(short, long)]
        download_dir: Option<PathBuf>,
    },
    /// Send a file to a discovered peer
    Send {
        /// Peer id or display name
        #[arg(long)]
        to: String,
        /// File to send
        #[arg(long)]
        file: PathBuf,
        /// Seconds to wait for the peer to appear
        #[arg(long, default_value = "15")]
        wait: u64,
    },
    /// List peers visible on the network
    Peers {
        /// Seconds to listen for announcements
        #[arg(long, default_value = "10")]
        wait: u64,
    },
}

struct Node {
    socket: Arc<SocketEngine>,
    discovery: Arc<DiscoveryService>,
    manager: TransferManager,
}

async fn start_node(cli: &Cli) -> Option<Node> {
    let config = Config {
        display_name: cli.name.clone(),
        transfer_port: cli.transfer_port,
        discovery_port: cli.discovery_port,
        ..Config::default()
    };

    let platform = Arc::new(NativePlatform::new());
    let socket = Arc::new(SocketEngine::new());
    let discovery = Arc::new(DiscoveryService::new(
        socket.clone(),
        platform.clone(),
        &config,
    ));
    let file_io = Arc::new(FileIo::new(platform));
    let manager = TransferManager::new(
        file_io,
        socket.clone(),
        discovery.clone(),
        config.transfer_port,
    );

    if discovery.start().await.is_err() {
        eprintln!("error: failed to start discovery");
        return None;
    }
    if !manager.init().await {
        eprintln!("error: failed to bind transfer port {}", config.transfer_port);
        discovery.stop();
        return None;
    }

    if let Some(password) = &cli.password {
        manager.set_encryption(true, password.clone());
    }

    Some(Node {
        socket,
        discovery,
        manager,
    })
}

async fn shutdown_node(node: Node) {
    node.manager.shutdown().await;
    node.discovery.stop();
    node.socket.shutdown().await;
}

#[tokio::main]
async fn main() {
    lanlink::utils::setup_logging();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { download_dir } => {
            let Some(node) = start_node(&cli).await else {
                std::process::exit(1);
            };

            if let Some(dir) = download_dir {
                node.manager.set_default_download_dir(dir.clone());
            }

            node.discovery.on_peer_discovered(Arc::new(|peer, is_new| {
                if is_new {
                    println!("peer joined: {} ({}) at {}", peer.name, peer.id, peer.endpoint());
                }
            }));
            node.discovery.on_peer_lost(Arc::new(|peer_id| {
                println!("peer left: {}", peer_id);
            }));
            node.manager.on_request(Arc::new(|transfer| {
                println!(
                    "accepting {} ({} bytes) from {}",
                    transfer.file_name, transfer.file_size, transfer.peer_name
                );
                true
            }));
            node.manager.on_status(Arc::new(|transfer| {
                if transfer.status.is_terminal() {
                    println!(
                        "transfer {} {}: {}",
                        transfer.id, transfer.status, transfer.file_name
                    );
                }
            }));

            println!(
                "listening as \"{}\" (peer id {})",
                node.discovery.display_name(),
                node.discovery.peer_id()
            );
            println!("downloads go to {}", node.manager.default_download_dir().display());

            tokio::signal::ctrl_c().await.ok();
            println!("shutting down");
            shutdown_node(node).await;
        }

        Commands::Send { to, file, wait } => {
            let Some(node) = start_node(&cli).await else {
                std::process::exit(1);
            };

            // Wait for the target to announce itself.
            let mut target = None;
            for _ in 0..(*wait * 5) {
                target = node
                    .discovery
                    .known_peers()
                    .into_iter()
                    .find(|p| p.id == *to || p.name == *to);
                if target.is_some() {
                    break;
                }
                sleep(Duration::from_millis(200)).await;
            }

            let Some(peer) = target else {
                eprintln!("error: peer \"{}\" not found within {}s", to, wait);
                shutdown_node(node).await;
                std::process::exit(1);
            };

            println!("sending {} to {} ({})", file.display(), peer.name, peer.endpoint());
            let transfer_id = node.manager.send_file(&peer.id, file).await;
            if transfer_id.is_empty() {
                eprintln!("error: transfer could not be started");
                shutdown_node(node).await;
                std::process::exit(1);
            }

            let mut last_progress = -1.0f32;
            loop {
                let Some(transfer) = node.manager.transfer(&transfer_id) else {
                    break;
                };
                if transfer.progress != last_progress {
                    last_progress = transfer.progress;
                    print!("\r{:>5.1}%", transfer.progress);
                    use std::io::Write;
                    std::io::stdout().flush().ok();
                }
                if transfer.status.is_terminal() {
                    println!();
                    match transfer.status {
                        TransferStatus::Completed => println!("done"),
                        status => {
                            eprintln!("{}: {}", status, transfer.error_message);
                        }
                    }
                    break;
                }
                sleep(Duration::from_millis(200)).await;
            }

            shutdown_node(node).await;
        }

        Commands::Peers { wait } => {
            let Some(node) = start_node(&cli).await else {
                std::process::exit(1);
            };

            println!("listening for {}s...", wait);
            sleep(Duration::from_secs(*wait)).await;

            let peers = node.discovery.known_peers();
            if peers.is_empty() {
                println!("no peers found");
            }
            for peer in peers {
                println!(
                    "{}  {}  {}  ({} {})",
                    peer.id,
                    peer.name,
                    peer.endpoint(),
                    peer.platform,
                    peer.version
                );
            }

            shutdown_node(node).await;
        }
    }
}
