use clap::{Parser, Subcommand};
use lib::config::{self, Config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "subecho")]
#[command(about = "WebSocket subprotocol echo gateway and negotiation harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json (all defaults spelled out).
    Init {
        /// Config file path (default: SUBECHO_CONFIG_PATH or ~/.subecho/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the echo gateway (HTTP health + WebSocket upgrade on one port).
    Serve {
        /// Config file path (default: SUBECHO_CONFIG_PATH or ~/.subecho/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,

        /// Negotiation policy when no offered subprotocol is allowed: permissive or strict
        #[arg(long, value_name = "POLICY")]
        policy: Option<String>,

        /// Session gating: none or trigger-phrase
        #[arg(long, value_name = "MODE")]
        gating: Option<String>,

        /// Allowed subprotocol (repeat to build the list; replaces the configured list)
        #[arg(long = "allow", value_name = "PROTOCOL")]
        allow: Vec<String>,
    },

    /// Run the negotiation scenarios against an endpoint and print the summary.
    Harness {
        /// Config file path (default: SUBECHO_CONFIG_PATH or ~/.subecho/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Endpoint URL (default from config: ws://127.0.0.1:15152/ws)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Bearer token sent on each upgrade request
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,

        /// Exit with status 1 when any scenario failed
        #[arg(long)]
        strict_exit: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Commands::Serve { .. }) | Some(Commands::Harness { .. }) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Some(Commands::Version) => {
            println!("subecho {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve {
            config,
            port,
            policy,
            gating,
            allow,
        }) => {
            if let Err(e) = run_serve(config, port, policy, gating, allow).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Harness {
            config,
            url,
            token,
            strict_exit,
        }) => match run_harness(config, url, token).await {
            Ok(all_ok) => {
                if strict_exit && !all_ok {
                    std::process::exit(1);
                }
            }
            Err(e) => {
                log::error!("harness failed: {:#}", e);
                std::process::exit(1);
            }
        },
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// CLI flags win over file and environment.
fn apply_serve_flags(
    config: &mut Config,
    port: Option<u16>,
    policy: Option<String>,
    gating: Option<String>,
    allow: Vec<String>,
) -> anyhow::Result<()> {
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if let Some(p) = policy {
        config.negotiation.policy = config::parse_policy(&p).ok_or_else(|| {
            anyhow::anyhow!("unknown policy {:?} (expected permissive or strict)", p)
        })?;
    }
    if let Some(g) = gating {
        config.session.gating = config::parse_gating(&g).ok_or_else(|| {
            anyhow::anyhow!("unknown gating mode {:?} (expected none or trigger-phrase)", g)
        })?;
    }
    if !allow.is_empty() {
        config.negotiation.allow_list = allow;
    }
    Ok(())
}

async fn run_serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    policy: Option<String>,
    gating: Option<String>,
    allow: Vec<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    log::debug!("loaded config from {}", path.display());
    apply_serve_flags(&mut config, port, policy, gating, allow)?;
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    lib::gateway::run_gateway(config).await
}

/// Returns whether every scenario succeeded.
async fn run_harness(
    config_path: Option<PathBuf>,
    url: Option<String>,
    token: Option<String>,
) -> anyhow::Result<bool> {
    let (config, path) = config::load_config(config_path)?;
    log::debug!("loaded config from {}", path.display());

    let mut harness = lib::harness::Harness::from_config(&config);
    if let Some(url) = url {
        harness = harness.with_url(url);
    }
    if token.is_some() {
        harness = harness.with_token(token);
    }

    let report = harness.run().await;
    println!("\n{}", report);
    Ok(report.all_succeeded())
}
