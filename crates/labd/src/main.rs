//! labd CLI entry point.
//!
//! Without a subcommand this runs the session daemon. The other
//! subcommands are thin clients that talk to a running daemon, plus `env`
//! which inspects an interpreter locally.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lab_env::{introspect_versions, EnvironmentResolver, Platform};
use labd::client::LabClient;
use labd::daemon::{Daemon, DaemonAlreadyRunning, DaemonConfig};
use labd::manager::LaunchRequest;
use labd::session::{ServerItem, Session};
use labd::settings::load_settings;
use labd::singleton::get_running_daemon_info;
use log::info;

#[derive(Parser, Debug)]
#[command(name = "labd")]
#[command(about = "Session daemon for JupyterLab desktop")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Socket path for IPC (default: ~/.cache/jlab-desktop/labd.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default if no command specified)
    Run {
        /// Session list file (default: ~/.config/jlab-desktop/sessions.json)
        #[arg(long)]
        sessions: Option<PathBuf>,

        /// Directory for the lock and info files (default: ~/.cache/jlab-desktop)
        #[arg(long)]
        lock_dir: Option<PathBuf>,
    },

    /// Serve a folder, reusing its running server if there is one
    Launch {
        folder: PathBuf,

        /// Python interpreter to launch from
        #[arg(long)]
        python: Option<PathBuf>,

        /// Extra server arguments, e.g. "--ServerApp.ip=127.0.0.1"
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,

        /// Skip the default server arguments
        #[arg(long)]
        no_default_args: bool,
    },

    /// Connect to a server by URL
    Connect { url: String },

    /// List running servers
    Running,

    /// List recently used servers
    Recent,

    /// Stop the server for a folder or URL
    Stop { target: String },

    /// Re-check running servers and pick up ones started elsewhere
    Refresh,

    /// Check daemon status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show how an interpreter would be activated
    Env {
        python: PathBuf,

        /// Also ask the interpreter for package versions
        #[arg(long)]
        versions: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let client = || match &cli.socket {
        Some(path) => LabClient::new(path.clone()),
        None => LabClient::default(),
    };

    match cli.command {
        None => run_daemon(cli.socket.clone(), None, None).await,
        Some(Commands::Run {
            ref sessions,
            ref lock_dir,
        }) => run_daemon(cli.socket.clone(), sessions.clone(), lock_dir.clone()).await,
        Some(Commands::Launch {
            ref folder,
            ref python,
            ref args,
            no_default_args,
        }) => {
            let mut request = LaunchRequest::new(folder);
            if let Some(python) = python {
                request = request.with_python(python);
            }
            if let Some(args) = args {
                request = request.with_extra_args(args.as_str());
            }
            if no_default_args {
                request = request.with_override_defaults(true);
            }
            let (session, reused) = client().launch(request).await?;
            if reused {
                println!("Already running:");
            }
            print_session(&session);
            Ok(())
        }
        Some(Commands::Connect { ref url }) => {
            let session = client().connect(url).await?;
            print_session(&session);
            Ok(())
        }
        Some(Commands::Running) => {
            print_sessions(&client().list_running().await?);
            Ok(())
        }
        Some(Commands::Recent) => {
            print_recent(&client().list_recent().await?);
            Ok(())
        }
        Some(Commands::Stop { ref target }) => {
            let session = client().terminate(target).await?;
            println!("Stopped {}", session.title);
            Ok(())
        }
        Some(Commands::Refresh) => {
            print_sessions(&client().refresh().await?);
            Ok(())
        }
        Some(Commands::Status { json }) => status(&client(), json).await,
        Some(Commands::Env {
            ref python,
            versions,
        }) => inspect_env(python, versions).await,
    }
}

async fn run_daemon(
    socket: Option<PathBuf>,
    sessions: Option<PathBuf>,
    lock_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("labd starting...");

    let settings = load_settings();
    let mut config = DaemonConfig::from_settings(&settings);
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(sessions) = sessions {
        config.sessions_path = sessions;
    }
    if let Some(lock_dir) = lock_dir {
        config.lock_dir = lock_dir;
    }

    info!("Configuration:");
    info!("  Socket: {:?}", config.socket_path);
    info!("  Sessions: {:?}", config.sessions_path);
    info!("  Scripts: {:?}", config.manager.script_dir);
    info!("  Max recent: {}", config.manager.max_recent);

    let daemon = match Daemon::new(config) {
        Ok(d) => d,
        Err(e) => {
            if let Some(running) = e.downcast_ref::<DaemonAlreadyRunning>() {
                eprintln!("Error: {}", e);
                eprintln!(
                    "Running daemon: pid={}, endpoint={}",
                    running.info.pid, running.info.endpoint
                );
                std::process::exit(1);
            }
            return Err(e);
        }
    };
    daemon.run().await
}

async fn status(client: &LabClient, json: bool) -> anyhow::Result<()> {
    let daemon_info = get_running_daemon_info();
    let running = client.ping().await.is_ok();
    let sessions = if running {
        client.list_running().await.unwrap_or_default()
    } else {
        Vec::new()
    };

    if json {
        let output = serde_json::json!({
            "running": running,
            "daemon_info": daemon_info,
            "sessions": sessions,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("labd status");
    println!("===========");
    println!("Daemon: {}", if running { "running" } else { "stopped" });
    if let Some(info) = daemon_info.filter(|_| running) {
        println!("  PID: {}", info.pid);
        println!("  Version: {}", info.version);
        println!("  Endpoint: {}", info.endpoint);
        println!("  Started: {}", info.started_at);
    }
    if running {
        println!();
        print_sessions(&sessions);
    }
    Ok(())
}

async fn inspect_env(python: &std::path::Path, versions: bool) -> anyhow::Result<()> {
    let resolver = EnvironmentResolver::for_platform(Platform::current());
    let mut env = resolver
        .resolve(python)
        .with_context(|| format!("Cannot use {}", python.display()))?;
    if versions {
        let found = introspect_versions(&env.path).await;
        env = env.with_versions(found);
    }
    println!("{}", serde_json::to_string_pretty(&env)?);
    Ok(())
}

fn print_session(session: &Session) {
    println!("{}  {:?}", session.title, session.state);
    println!("  {}", session.url);
    if let Some(dir) = &session.working_directory {
        println!("  {}", dir.display());
    }
}

fn print_sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No running servers");
    }
    for session in sessions {
        print_session(session);
    }
}

fn print_recent(items: &[ServerItem]) {
    if items.is_empty() {
        println!("No recent servers");
    }
    for item in items {
        println!("{}  {}", item.title, item.folder.as_deref().unwrap_or(&item.link));
    }
}
