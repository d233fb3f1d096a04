use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use studio_cache::backend::{
  open_store, CachedStudioClient, OrganizationSettings, Profile, UserPreferences,
};
use studio_cache::cache::{inspect_slots, remove_slots, CacheResult, Cacheable};
use studio_cache::config::Config;
use studio_cache::identity::Identity;

#[derive(Parser, Debug)]
#[command(name = "studio-cache")]
#[command(about = "Cache-first access to studio backend entities")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/studio-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Act as this user instead of the one the access token belongs to
  #[arg(short, long, global = true)]
  user: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an entity, from cache when fresh
  Fetch {
    entity: Entity,
    id: String,
    /// Skip the cache and the refetch throttle
    #[arg(short, long)]
    force: bool,
  },
  /// Drop persisted entries
  Clear {
    entity: Option<Entity>,
    id: Option<String>,
  },
  /// List persisted entries and their age
  Inspect,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Entity {
  OrganizationSettings,
  Profile,
  UserPreferences,
}

impl Entity {
  fn entity_type(self) -> &'static str {
    match self {
      Entity::OrganizationSettings => OrganizationSettings::entity_type(),
      Entity::Profile => Profile::entity_type(),
      Entity::UserPreferences => UserPreferences::entity_type(),
    }
  }
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("studio-cache")
    .join("logs");

  let file_appender = tracing_appender::rolling::daily(log_dir, "studio-cache.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(env_filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer),
    )
    .init();

  Ok(guard)
}

#[derive(Serialize)]
struct FetchOutput<T> {
  source: String,
  cached_at: Option<String>,
  data: T,
}

fn print_result<T: Serialize>(result: CacheResult<T>) -> Result<()> {
  let output = FetchOutput {
    source: format!("{:?}", result.source),
    cached_at: result.cached_at.map(|t| t.to_rfc3339()),
    data: result.data,
  };
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn fetch(
  config: &Config,
  user: Option<String>,
  entity: Entity,
  id: &str,
  force: bool,
) -> Result<()> {
  let client = CachedStudioClient::new(config)?;

  let user = match user {
    Some(user) => user,
    None => client.backend().current_user().await?.id,
  };
  client.switch_identity(Some(Identity::new(user)));

  match entity {
    Entity::OrganizationSettings if force => {
      print_result(client.refresh_organization_settings(id).await?)
    }
    Entity::OrganizationSettings => print_result(client.organization_settings(id).await?),
    Entity::Profile if force => print_result(client.refresh_profile(id).await?),
    Entity::Profile => print_result(client.profile(id).await?),
    Entity::UserPreferences if force => print_result(client.refresh_preferences(id).await?),
    Entity::UserPreferences => print_result(client.preferences(id).await?),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Fetch { entity, id, force } => fetch(&config, args.user, entity, &id, force).await?,
    Command::Clear { entity, id } => {
      let store = open_store(&config.cache)?;
      let prefix = &config.cache.storage_prefix;
      let removed = match (entity, id) {
        (None, _) => remove_slots(store.as_ref(), prefix)?,
        (Some(entity), None) => {
          remove_slots(store.as_ref(), &format!("{}{}:", prefix, entity.entity_type()))?
        }
        (Some(entity), Some(id)) => {
          let slot = format!("{}{}:{}", prefix, entity.entity_type(), id);
          let existed = store.get(&slot)?.is_some();
          store.remove(&slot)?;
          usize::from(existed)
        }
      };
      println!("Removed {} entries", removed);
    }
    Command::Inspect => {
      let store = open_store(&config.cache)?;
      let now = Utc::now();
      for summary in inspect_slots(store.as_ref(), &config.cache.storage_prefix)? {
        let age = summary
          .cached_at
          .map(|t| format!("{}s", (now - t).num_seconds()))
          .unwrap_or_else(|| "-".to_string());
        let owner = summary
          .owner
          .as_ref()
          .map(Identity::as_str)
          .unwrap_or("-");
        let state = if summary.valid { "ok" } else { "invalid" };
        println!("{:<60} {:>10} {:<24} {}", summary.slot, age, owner, state);
      }
    }
  }

  Ok(())
}
