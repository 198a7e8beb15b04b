use clap::{Args, Parser, Subcommand};
use flowbot::{
    config::{ConfigManager, EngineSettings, EnvConfigManager},
    engine::FlowEngine,
    flow::FlowManager,
    flow_commands::validate_flow_file,
    logger::init_tracing,
    message::InboundMessage,
    schema::write_schema,
};
use std::{env, path::PathBuf, process};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "flowbot",
    about = "Multi-tenant conversational flow engine",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chat with the flows of a tenant over stdin/stdout
    Chat(ChatArgs),

    /// Emit JSON-Schema for flow documents into `<root>/schemas`
    Schema,

    /// Manage flows
    Flow(FlowArgs),
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long)]
    tenant: String,

    #[arg(long, default_value = "local")]
    contact: String,

    /// Log level directive (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    /// Parse and lint a flow file
    Validate { file: PathBuf },
}

/// Resolve the flowbot root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("FLOWBOT_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./flowbot")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Chat(args) => chat(resolve_root_dir(), args).await,
        Commands::Schema => {
            let out_dir = resolve_root_dir().join("schemas");
            let written = write_schema(&out_dir)?;
            println!("Schemas written to {}: {}", out_dir.display(), written.join(", "));
            Ok(())
        }
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => match validate_flow_file(&file) {
                Ok(report) => {
                    for warning in &report.warnings {
                        println!("⚠️  {}", warning);
                    }
                    println!("✅ Flow file is valid.");
                    Ok(())
                }
                Err(err) => {
                    eprintln!("🛑 {:#}", err);
                    process::exit(1);
                }
            },
        },
    }
}

async fn chat(root: PathBuf, args: ChatArgs) -> anyhow::Result<()> {
    init_tracing(
        root.clone(),
        "logs/flowbot.log".to_string(),
        "logs/turns.json".to_string(),
        args.log_level.clone(),
    )?;
    info!("flowbot starting in {}", root.display());

    let config = ConfigManager(EnvConfigManager::new(root.join(".env")));
    let settings = EngineSettings::from_config(&config).await;

    let flows = FlowManager::new();
    let loaded = flows.load_all_flows_from_dir(&root.join("flows"))?;
    if flows.flows_for(&args.tenant).is_empty() {
        error!("no flows for tenant `{}` in {}", args.tenant, root.join("flows").display());
        eprintln!("No flows for tenant `{}` ({} loaded in total).", args.tenant, loaded);
        process::exit(1);
    }

    let sweep_every = settings.sweep_interval;
    let engine = FlowEngine::from_settings(flows.clone(), settings);
    let cancel = CancellationToken::new();
    let sweeper = engine.sessions().spawn_idle_sweeper(sweep_every, cancel.clone());

    println!(
        "Chatting with `{}` as `{}`; {} flow(s) loaded. Ctrl-C or end of input to quit.",
        args.tenant, args.contact, loaded
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = engine
                    .handle_message(InboundMessage::new(&args.tenant, &args.contact, "cli", &line))
                    .await;
                for message in &reply.messages {
                    println!("bot> {}", message);
                }
                if !reply.awaiting_input {
                    println!("     [{}]", reply.outcome.as_str());
                }
            }
        }
    }

    println!("\nShutting down…");
    cancel.cancel();
    sweeper.await.ok();
    flows.shutdown_all();
    info!("flowbot stopped");
    println!("Goodbye!");
    Ok(())
}
