use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use assign_lite::config::{LeaderConfig, QueueConfig, RefreshConfig};
use assign_lite::error::QueueError;
use assign_lite::item::{WorkItem, WorkKind};
use assign_lite::leader::MemoryLockStore;
use assign_lite::node::Node;
use assign_lite::priority::PriorityResolver;
use assign_lite::refresh::Eligibility;
use assign_lite::shutdown::install_shutdown_handler;
use assign_lite::store::{MemorySourceStore, MemoryViewStore};

#[derive(Parser, Debug)]
#[command(name = "assign-lite")]
#[command(version)]
#[command(about = "Lease-based work assignment over leader-refreshed materialized views")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a queue node
    Server(ServerArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Identity written into the leader lock (default: random per process)
    #[arg(long, env = "ASSIGN_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Port for the monitoring dashboard (optional)
    #[arg(long, env = "ASSIGN_DASHBOARD_PORT")]
    dashboard_port: Option<u16>,

    /// JSON file mapping region to priority rank
    #[arg(long, env = "ASSIGN_PRIORITY_TABLE")]
    priorities: Option<PathBuf>,

    /// JSON array of work items to load into the in-memory store at startup
    #[arg(long, env = "ASSIGN_SEED_FILE")]
    seed: Option<PathBuf>,

    // === Leases ===
    /// Lease duration in seconds
    #[arg(long, env = "ASSIGN_LEASE_SECS", default_value = "1800")]
    lease_secs: u64,

    /// Candidates tried per claim before reporting an empty queue
    #[arg(long, env = "ASSIGN_MAX_CLAIM_ATTEMPTS", default_value = "8")]
    max_claim_attempts: usize,

    /// View entries not refreshed within this many seconds are purged
    #[arg(long, env = "ASSIGN_STALENESS_SECS", default_value = "3600")]
    staleness_secs: u64,

    // === Refresh ===
    /// Review view refresh interval in seconds
    #[arg(long, env = "ASSIGN_REVIEW_REFRESH_SECS", default_value = "60")]
    review_refresh_secs: u64,

    /// Dial view refresh interval in seconds
    #[arg(long, env = "ASSIGN_DIAL_REFRESH_SECS", default_value = "15")]
    dial_refresh_secs: u64,

    /// Only items created within this many hours are scanned
    #[arg(long, env = "ASSIGN_RECENT_WINDOW_HOURS", default_value = "24")]
    recent_window_hours: u64,

    /// Source rows read per refresh cycle
    #[arg(long, env = "ASSIGN_ROW_CAP", default_value = "5000")]
    row_cap: usize,

    /// View entries written per batch
    #[arg(long, env = "ASSIGN_BATCH_SIZE", default_value = "200")]
    batch_size: usize,

    /// Only offer reviews that carry a playable recording
    #[arg(long, env = "ASSIGN_REVIEW_REQUIRE_AUDIO")]
    review_require_audio: bool,

    /// Do not offer contacts already queued in a dialer batch
    #[arg(long, env = "ASSIGN_DIAL_EXCLUDE_BATCHED")]
    dial_exclude_batched: bool,

    // === Leader lock ===
    /// Leader lock key
    #[arg(long, env = "ASSIGN_LEADER_KEY", default_value = "assign-lite/view-refresher")]
    leader_key: String,

    /// Leader lock TTL in seconds
    #[arg(long, env = "ASSIGN_LEADER_TTL_SECS", default_value = "60")]
    leader_ttl_secs: u64,

    /// Leader lock renewal interval in seconds (must be below the TTL)
    #[arg(long, env = "ASSIGN_LEADER_RENEW_SECS", default_value = "30")]
    leader_renew_secs: u64,
}

impl ServerArgs {
    fn refresh(&self, interval_secs: u64) -> Result<RefreshConfig, QueueError> {
        let interval = Duration::from_secs(interval_secs);
        let window_secs = self.recent_window_hours.checked_mul(60 * 60).ok_or_else(|| {
            QueueError::InvalidConfig(format!(
                "recent window of {} hours is out of range",
                self.recent_window_hours
            ))
        })?;
        Ok(RefreshConfig {
            interval,
            recent_window: Duration::from_secs(window_secs),
            row_cap: self.row_cap,
            batch_size: self.batch_size,
            // leave a little of the interval unused so a slow cycle ends before the next tick
            cycle_timeout: interval.mul_f64(0.8).max(Duration::from_secs(1)),
        })
    }

    fn queue_config(&self) -> Result<QueueConfig, QueueError> {
        let mut leader = LeaderConfig {
            key: self.leader_key.clone(),
            ttl: Duration::from_secs(self.leader_ttl_secs),
            renew_interval: Duration::from_secs(self.leader_renew_secs),
            ..LeaderConfig::default()
        };
        if let Some(ref id) = self.instance_id {
            leader.holder_id = id.clone();
        }

        Ok(QueueConfig {
            lease_duration: Duration::from_secs(self.lease_secs),
            staleness_bound: Duration::from_secs(self.staleness_secs),
            max_claim_attempts: self.max_claim_attempts,
            review: self.refresh(self.review_refresh_secs)?,
            dial: self.refresh(self.dial_refresh_secs)?,
            leader,
        })
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn load_seed(path: &Path) -> Result<Vec<WorkItem>, Box<dyn std::error::Error>> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.queue_config()?;
    config.validate()?;

    let priorities = match args.priorities {
        Some(ref path) => PriorityResolver::load_or_empty(path).await,
        None => {
            tracing::warn!("No priority table configured, every item gets the unranked priority");
            PriorityResolver::empty()
        }
    };

    let source = Arc::new(MemorySourceStore::new());
    if let Some(ref path) = args.seed {
        let items = load_seed(path).await?;
        tracing::info!(path = %path.display(), items = items.len(), "Seeding work items");
        source.insert_many(items).await;
    }

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    tracing::info!(
        holder_id = %config.leader.holder_id,
        dashboard_addr = ?dashboard_addr,
        lease_secs = config.lease_duration.as_secs(),
        review_refresh_secs = config.review.interval.as_secs(),
        dial_refresh_secs = config.dial.interval.as_secs(),
        "Starting assign-lite node"
    );

    let mut node = Node::new(
        config,
        source,
        Arc::new(MemoryViewStore::new()),
        Arc::new(MemoryLockStore::new()),
        priorities,
        dashboard_addr,
    )?;
    if args.review_require_audio {
        node = node.with_eligibility(WorkKind::Review, Eligibility::requires_audio());
    }
    if args.dial_exclude_batched {
        node = node.with_eligibility(WorkKind::Dial, Eligibility::excludes_batched());
    }

    let shutdown = install_shutdown_handler();
    node.run(shutdown).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
    }
}
