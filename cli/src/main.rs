mod remote;

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use cobalt_cascade::{
    cascade::{Cascade, CascadeOptions, Phase, PostRenderer, RenderedPost},
    config::Config,
    messages::{LogMessages, Messages, UserMessage},
    net::{loopback::loopback, Correlator},
    sort::{SortProtocol, SortType, UserIdentity},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use remote::Script;

/// Pages through a simulated inbox.
#[derive(Parser, Debug)]
#[command(name = "cobalt", version)]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Which posts to sort.
    #[arg(short = 't', long, default_value = "global_all")]
    sort_type: SortType,

    /// Pages the simulated data store has.
    #[arg(short, long, default_value_t = 3)]
    pages: i64,

    /// Make the data store fail this page once.
    #[arg(long)]
    fail_page: Option<i64>,

    /// Make the data store sit on this page for `--delay-ms`.
    #[arg(long)]
    slow_page: Option<i64>,

    #[arg(long, default_value_t = 1_000)]
    delay_ms: u64,

    /// How often a failed page is retried before giving up.
    #[arg(long, default_value_t = 1)]
    retries: u32,
}

struct StdoutRenderer;

impl PostRenderer for StdoutRenderer {
    fn clear(&mut self) {
        println!("----");
    }

    fn insert(&mut self, at: usize, posts: &[RenderedPost]) {
        for (i, rendered) in posts.iter().enumerate() {
            let marker = if rendered.is_new { "*" } else { " " };
            println!("{:>3} {marker} {}", at + i, rendered.post.raw());
        }
    }

    fn show_retry(&mut self) {
        println!("  [retry]");
    }

    fn exhausted(&mut self) {
        println!("  (no more posts)");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    info!(host = %config.host, sort_type = %args.sort_type, "starting");

    let (bridge, remote) = loopback(config.allow_list());
    let (correlator, _) = Correlator::spawn(Arc::new(bridge), config.timeout_budget())?;
    let script = Script {
        pages: args.pages,
        fail_page: args.fail_page,
        slow_page: args.slow_page.map(|p| (p, Duration::from_millis(args.delay_ms))),
        last_viewed: 1_700_000_000,
    };
    tokio::spawn(remote::serve(remote, config.data_store(), script));

    let messages = Arc::new(LogMessages);
    let protocol = SortProtocol::new(correlator, config.data_store(), messages.clone());
    let user = config.user.clone().unwrap_or_else(|| UserIdentity {
        username: "demo".to_string(),
        domain: config.host.clone(),
    });
    let options = CascadeOptions::builder()
        .filter(config.default_filter.clone())
        .user(user)
        .sort_type(args.sort_type)
        .build();
    let (cascade, _) = Cascade::spawn(Arc::new(protocol), options, StdoutRenderer);

    cascade.construct();
    let mut retries = args.retries;
    loop {
        let Some(view) = cascade.view().await else { break };
        match view.phase {
            Phase::Loading => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Phase::Rendering => cascade.load_more(),
            Phase::Error if retries > 0 => {
                retries -= 1;
                let notice = format!("Retrying page {}.", view.page);
                messages.add_message(UserMessage::notice(notice));
                cascade.retry();
            }
            Phase::Unavailable => {
                warn!(data_store = %config.data_store(), "data store refused the request");
                break;
            }
            Phase::Error | Phase::Exhausted | Phase::Empty => {
                info!(phase = ?view.phase, posts = view.posts.len(), "done");
                break;
            }
        }
    }
    Ok(())
}
