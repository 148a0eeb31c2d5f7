use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::info;

use synq::api::types::{Notification, NotificationFilter, Priority};
use synq::api::{ApiClient, ApiError, NotificationBackend, RemoteCaller};
use synq::auth::StoredToken;
use synq::cache::{CacheConfig, QueryCache};
use synq::config::Config;
use synq::logging::{self, LogConfig};
use synq::mutation::BatchRunner;
use synq::notifications::{DesktopNotifier, NotificationCenter, Permission};
use synq::realtime::{ConnectionManager, WsConnector};

#[derive(Parser, Debug)]
#[command(name = "synq")]
#[command(about = "Notification sync client for the dashboard backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/synq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Stay connected and print pushed notifications
  Watch,
  /// List notifications
  List {
    #[arg(long)]
    unread: bool,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    priority: Option<Priority>,
    #[arg(long)]
    search: Option<String>,
  },
  /// Print the unread count
  Unread,
  /// Print notification statistics
  Stats,
  /// List notifications grouped by type and category
  Groups,
  /// Mark one notification as read
  Read { id: u64 },
  /// Mark several notifications as read in bounded concurrent batches
  ReadMany { ids: Vec<u64> },
  /// Mark every notification as read
  ReadAll,
  /// Dismiss one notification
  Dismiss { id: u64 },
  /// Dismiss every notification
  DismissAll,
  /// Print notification preferences
  Prefs,
  /// Load the list and count, then print cache metrics
  CacheMetrics,
}

/// Prints pushed notifications to stdout.
struct StdoutNotifier;

impl DesktopNotifier for StdoutNotifier {
  fn permission(&self) -> Permission {
    Permission::Granted
  }

  fn show(&self, n: &Notification) {
    println!("* {}", format_notification(n));
  }
}

fn format_notification(n: &Notification) -> String {
  let marker = if n.is_read { " " } else { "●" };
  format!(
    "{} {:>6}  {:<8}  {:<12}  {}",
    marker,
    n.id,
    n.priority,
    n.category,
    n.title
  )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  logging::init(&LogConfig::from(&config.logging))?;

  let tokens = Arc::new(StoredToken::new());
  let client = Arc::new(ApiClient::new(&config, tokens.clone())?);
  let caller = RemoteCaller::default().with_timeout(Duration::from_secs(config.api.timeout_secs));
  let cache = QueryCache::new(CacheConfig::from(&config.cache), caller);

  let filter = match &args.command {
    Command::List {
      unread,
      category,
      priority,
      search,
    } => NotificationFilter {
      is_read: unread.then_some(false),
      category: category.clone(),
      priority: *priority,
      search: search.clone(),
      ..Default::default()
    },
    _ => NotificationFilter::default(),
  };
  let center = NotificationCenter::new(cache.clone(), client.clone()).with_filter(filter);

  match args.command {
    Command::Watch => watch(&config, center, tokens).await?,
    Command::List { .. } => {
      let (items, unread) = center.load().await?;
      for n in &items {
        println!("{}", format_notification(n));
      }
      println!("{} shown, {} unread", items.len(), unread);
    }
    Command::Unread => {
      let (_, unread) = center.load().await?;
      println!("{}", unread);
    }
    Command::Stats => print_json(&center.stats().await?)?,
    Command::Groups => {
      center.load().await?;
      for group in center.groups() {
        println!(
          "{:<8}  {:<12}  {:<12}  {} ({} unread)",
          group.priority, group.kind, group.category, group.count, group.unread
        );
      }
    }
    Command::Read { id } => {
      center.load().await?;
      center.mark_as_read(id).await?;
      println!("marked {} as read", id);
    }
    Command::ReadMany { ids } => {
      let backend = client.clone();
      let runner = BatchRunner::new(cache.clone(), move |id: u64| {
        let backend = backend.clone();
        async move {
          backend.mark_read(id).await?;
          Ok::<_, ApiError>(id)
        }
      })
      .with_concurrency(config.batch.concurrency);

      for id in ids {
        runner.add_to_batch(id);
      }
      let result = runner.process_batch().await;
      for failure in &result.errors {
        eprintln!("item {}: {}", failure.index, failure.error);
      }
      println!("{} marked read, {} failed", result.results.len(), result.errors.len());
    }
    Command::ReadAll => {
      center.load().await?;
      center.mark_all_as_read().await?;
      println!("all notifications marked as read");
    }
    Command::Dismiss { id } => {
      center.load().await?;
      center.dismiss(id).await?;
      println!("dismissed {}", id);
    }
    Command::DismissAll => {
      center.load().await?;
      center.dismiss_all().await?;
      println!("all notifications dismissed");
    }
    Command::Prefs => print_json(&center.preferences().await?)?,
    Command::CacheMetrics => {
      center.load().await?;
      center.stats().await?;
      print_json(&cache.cache_metrics())?;
    }
  }

  Ok(())
}

/// Hold the push connection open until interrupted.
async fn watch(config: &Config, center: NotificationCenter, tokens: Arc<StoredToken>) -> Result<()> {
  let center = center.with_notifier(Arc::new(StdoutNotifier));
  let (items, unread) = center.load().await?;
  println!("{} notifications, {} unread", items.len(), unread);

  let connector = Arc::new(WsConnector::new(config.realtime_url()?, tokens));
  let manager = ConnectionManager::new(connector, Arc::new(center.clone()), &config.realtime);
  let gc = center
    .cache()
    .spawn_gc(Duration::from_secs(config.cache.gc_interval_secs));

  let lease = manager.attach();
  let mut states = lease.watch();
  // Keeps the list and count refetching on invalidation
  let _watch = center.observe();

  loop {
    tokio::select! {
      changed = states.changed() => {
        if changed.is_err() {
          break;
        }
        let state = *states.borrow();
        info!(state = %state, "connection state changed");
        println!("[{}]", state);
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  drop(lease);
  manager.shutdown();
  gc.abort();
  Ok(())
}
