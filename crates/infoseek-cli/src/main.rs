mod render;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use infoseek_core::UnknownAgentPolicy;
use infoseek_stream::{http_session, ClientConfig, SearchRequest, SessionState};
use std::io;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "infoseek")]
#[command(about = "Follow multi-agent search progress", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a search and stream agent progress until it settles
    Search(SearchArgs),
}

#[derive(Args)]
struct SearchArgs {
    #[arg(required = true, num_args = 1..)]
    query: Vec<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    no_web: bool,
    #[arg(long)]
    no_rag: bool,
    #[arg(long, default_value_t = 10)]
    max_results: u32,
    /// ignore | register
    #[arg(long)]
    unknown_agents: Option<UnknownAgentPolicy>,
    #[arg(long)]
    reconnect_attempts: Option<u32>,
    /// Print the final snapshot as JSON instead of the timeline
    #[arg(long)]
    json: bool,
    #[arg(long)]
    important_only: bool,
}

enum Step {
    Interrupted,
    Event(bool),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Search(args) => run_search(args).await,
    }
}

async fn run_search(args: SearchArgs) -> Result<()> {
    let mut config = ClientConfig::from_env();
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if let Some(policy) = args.unknown_agents {
        config.unknown_agents = policy;
    }
    if let Some(attempts) = args.reconnect_attempts {
        config.reconnect.max_attempts = attempts;
    }

    let request = SearchRequest {
        query: args.query.join(" "),
        session_id: args.session_id,
        include_web: !args.no_web,
        include_rag: !args.no_rag,
        max_results: args.max_results,
    };
    if request.query.trim().is_empty() {
        bail!("query must not be empty");
    }

    let mut session = http_session(&config).context("failed to build HTTP client")?;
    let session_id = session.start(request)?;
    info!(event = "cli_search_started", session_id = %session_id, base_url = %config.base_url);
    if !args.json {
        println!("session {session_id}");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_printed = 0u64;

    while !session.state().is_settled() {
        let step = tokio::select! {
            _ = &mut ctrl_c => Step::Interrupted,
            next = session.next_event() => Step::Event(next.is_some()),
        };
        match step {
            Step::Interrupted => {
                session.close();
                break;
            }
            Step::Event(false) => break,
            Step::Event(true) => {}
        }
        if args.json {
            continue;
        }
        let snapshot = session.snapshot();
        for entry in snapshot.timeline.iter() {
            if entry.id <= last_printed {
                continue;
            }
            last_printed = entry.id;
            if args.important_only && !entry.important {
                continue;
            }
            println!("{}", render::timeline_line(entry));
        }
    }

    let snapshot = session.snapshot();
    if args.json {
        println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
    } else {
        println!();
        print!("{}", render::agent_table(&snapshot.agents));
        if let Some(result) = &snapshot.final_result {
            println!();
            print!("{}", render::final_result(result));
        }
    }

    match snapshot.state {
        SessionState::Completed => Ok(()),
        SessionState::Failed => bail!(
            "search failed: {}",
            snapshot.error_message.as_deref().unwrap_or("unknown error")
        ),
        SessionState::Closed => bail!("search interrupted"),
        state => bail!("search ended while {state}"),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_enabled = matches!(
        std::env::var("INFOSEEK_LOG_STDERR").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stderr_enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
