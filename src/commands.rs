//! Command-line subcommands and their handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use tracing::info;

use nexus_store::api::ApiClient;
use nexus_store::clock::SystemClock;
use nexus_store::config::Config;
use nexus_store::crypto::{Encryptor, FileSecretStore, KeySource};
use nexus_store::queue::RequestQueue;
use nexus_store::store::{
  KvBackend, LocalStore, Priority, SetOptions, SqliteBackend, StoreOptions, StoreValue,
};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Print the value stored under a key
  Get { key: String },

  /// Store a value (a string unless --json or --date is given)
  Set {
    key: String,
    value: String,

    /// Parse the value as JSON
    #[arg(long, conflicts_with = "date")]
    json: bool,

    /// Parse the value as an RFC 3339 date
    #[arg(long)]
    date: bool,

    /// Store the value in the clear
    #[arg(long)]
    no_encrypt: bool,

    /// Expire the value after this many seconds
    #[arg(long)]
    ttl: Option<u64>,

    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    priority: PriorityArg,
  },

  /// Remove a key
  Delete { key: String },

  /// List keys
  Keys {
    /// Only keys starting with this prefix
    #[arg(long)]
    prefix: Option<String>,
  },

  /// Show store statistics
  Stats,

  /// Remove expired entries
  Purge,

  /// Write all entries as a JSON document
  Export {
    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },

  /// Load entries from a JSON export document
  Import { path: PathBuf },

  /// Encrypt a string with the device key
  Encrypt { text: String },

  /// Decrypt an envelope produced by `encrypt`
  Decrypt { envelope: String },

  /// Replace the master key and re-encrypt stored entries
  RotateKey,

  /// Inspect or flush the offline request queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
  /// Show queued requests
  List,
  /// Send queued requests now
  Drain,
  /// Discard all queued requests
  Clear,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityArg {
  Low,
  Normal,
  High,
}

impl From<PriorityArg> for Priority {
  fn from(arg: PriorityArg) -> Self {
    match arg {
      PriorityArg::Low => Priority::Low,
      PriorityArg::Normal => Priority::Normal,
      PriorityArg::High => Priority::High,
    }
  }
}

/// Open the on-disk store described by `config` and run `command`.
pub async fn run(command: Command, config: &Config) -> Result<String> {
  let secrets = FileSecretStore::new(config.secrets_dir()?);
  let encryptor = Arc::new(Encryptor::new(
    Arc::new(secrets),
    config.crypto.allow_ephemeral_key,
  ));

  let path = config.store_path()?;
  let backend = SqliteBackend::open(&path)
    .map_err(|e| eyre!("Failed to open store {}: {}", path.display(), e))?;
  let store = LocalStore::with_options(
    backend,
    encryptor,
    StoreOptions::from(&config.storage),
    Arc::new(SystemClock),
  )?;

  execute(command, &store, config).await
}

/// Run `command` against `store` and return the text to print.
pub async fn execute<B: KvBackend>(
  command: Command,
  store: &LocalStore<B>,
  config: &Config,
) -> Result<String> {
  match command {
    Command::Get { key } => match store.get(&key)? {
      Some(value) => Ok(render(&value)),
      None => Err(eyre!("Key not found: {}", key)),
    },

    Command::Set {
      key,
      value,
      json,
      date,
      no_encrypt,
      ttl,
      priority,
    } => {
      let value = parse_value(&value, json, date)?;
      let mut options = SetOptions::default()
        .with_encrypt(!no_encrypt)
        .with_priority(priority.into());
      if let Some(secs) = ttl {
        options = options.with_ttl(Duration::from_secs(secs));
      }
      store.set(&key, value, options)?;
      Ok(String::new())
    }

    Command::Delete { key } => {
      if store.delete(&key)? {
        Ok(String::new())
      } else {
        Err(eyre!("Key not found: {}", key))
      }
    }

    Command::Keys { prefix } => {
      let keys: Vec<String> = store
        .keys()?
        .into_iter()
        .filter(|k| prefix.as_deref().map_or(true, |p| k.starts_with(p)))
        .collect();
      Ok(keys.join("\n"))
    }

    Command::Stats => {
      let stats = store.stats()?;
      let last_cleanup = match DateTime::<Utc>::from_timestamp_millis(stats.last_cleanup) {
        Some(at) if stats.last_cleanup > 0 => at.to_rfc3339(),
        _ => "never".to_string(),
      };
      let key_source = match store.encryptor().key_source()? {
        KeySource::Persistent => "persistent",
        KeySource::Ephemeral => "ephemeral (data will not survive a restart)",
      };
      Ok(format!(
        "items:        {}\nsize:         {} bytes\nlast cleanup: {}\nkey source:   {}",
        stats.total_items, stats.total_size, last_cleanup, key_source
      ))
    }

    Command::Purge => {
      let removed = store.purge_expired()?;
      Ok(format!("Removed {} expired entries", removed))
    }

    Command::Export { output } => {
      let document = store.export()?;
      let json = serde_json::to_string_pretty(&document)?;
      match output {
        Some(path) => {
          std::fs::write(&path, json)
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
          Ok(format!(
            "Exported {} entries to {}",
            document.data.len(),
            path.display()
          ))
        }
        None => Ok(json),
      }
    }

    Command::Import { path } => {
      let json = std::fs::read_to_string(&path)
        .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
      let imported = store.import_json(&json)?;
      Ok(format!("Imported {} entries", imported))
    }

    Command::Encrypt { text } => Ok(store.encryptor().encrypt(&text)?),

    Command::Decrypt { envelope } => Ok(store.encryptor().decrypt(envelope.trim())?),

    Command::RotateKey => {
      let rewritten = store.rotate_encryption_key()?;
      Ok(format!(
        "Master key rotated, {} entries re-encrypted",
        rewritten
      ))
    }

    Command::Queue { action } => queue_command(action, store, config).await,
  }
}

async fn queue_command<B: KvBackend>(
  action: QueueAction,
  store: &LocalStore<B>,
  config: &Config,
) -> Result<String> {
  let queue = Arc::new(RequestQueue::new(store.clone(), &config.queue));
  queue.restore()?;

  match action {
    QueueAction::List => {
      let lines: Vec<String> = queue
        .snapshot()
        .iter()
        .map(|item| {
          let queued_at = DateTime::<Utc>::from_timestamp_millis(item.timestamp)
            .map(|at| at.to_rfc3339())
            .unwrap_or_default();
          format!(
            "{}  {:<6} {}  retries={}  queued={}",
            item.id,
            item.request.method.as_str(),
            item.request.url,
            item.retry_count,
            queued_at
          )
        })
        .collect();
      if lines.is_empty() {
        Ok("Queue is empty".to_string())
      } else {
        Ok(lines.join("\n"))
      }
    }

    QueueAction::Drain => {
      let client = ApiClient::http(store.clone(), Arc::clone(&queue), config)?;
      let report = client.process_queue().await;
      info!(?report, "Drain finished");
      if report.skipped {
        return Ok(format!(
          "Offline, {} requests left in the queue",
          report.remaining
        ));
      }
      Ok(format!(
        "Delivered {}, failed {}, dropped {}, remaining {}",
        report.succeeded, report.failed, report.dropped, report.remaining
      ))
    }

    QueueAction::Clear => {
      let removed = queue.clear();
      Ok(format!("Removed {} queued requests", removed))
    }
  }
}

fn parse_value(raw: &str, json: bool, date: bool) -> Result<StoreValue> {
  if json {
    let value: serde_json::Value =
      serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON value: {}", e))?;
    return Ok(StoreValue::from_json(value)?);
  }
  if date {
    let parsed = DateTime::parse_from_rfc3339(raw)
      .map_err(|e| eyre!("Invalid RFC 3339 date '{}': {}", raw, e))?;
    return Ok(StoreValue::Date(parsed.with_timezone(&Utc)));
  }
  Ok(StoreValue::from(raw))
}

/// Plain text for strings, JSON for structured values.
fn render(value: &StoreValue) -> String {
  match value {
    StoreValue::String(s) => s.clone(),
    StoreValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
    StoreValue::Number(n) => n.to_string(),
    StoreValue::Boolean(b) => b.to_string(),
    StoreValue::Date(d) => d.to_rfc3339(),
    StoreValue::Object(map) => {
      serde_json::to_string_pretty(map).unwrap_or_else(|_| format!("{:?}", map))
    }
    StoreValue::Array(items) => {
      serde_json::to_string_pretty(items).unwrap_or_else(|_| format!("{:?}", items))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use nexus_store::clock::ManualClock;
  use nexus_store::crypto::MemorySecretStore;
  use nexus_store::store::MemoryBackend;

  fn store() -> LocalStore<MemoryBackend> {
    LocalStore::with_options(
      MemoryBackend::new(),
      Arc::new(Encryptor::new(Arc::new(MemorySecretStore::new()), false)),
      StoreOptions::default(),
      Arc::new(ManualClock::new(1_000)),
    )
    .unwrap()
  }

  fn set(key: &str, value: &str, json: bool) -> Command {
    Command::Set {
      key: key.into(),
      value: value.into(),
      json,
      date: false,
      no_encrypt: false,
      ttl: None,
      priority: PriorityArg::Normal,
    }
  }

  #[tokio::test]
  async fn set_then_get() {
    let store = store();
    let config = Config::default();
    execute(set("name", "nexus", false), &store, &config)
      .await
      .unwrap();
    execute(set("count", "42", true), &store, &config)
      .await
      .unwrap();

    let name = execute(Command::Get { key: "name".into() }, &store, &config)
      .await
      .unwrap();
    assert_eq!(name, "nexus");
    let count = execute(Command::Get { key: "count".into() }, &store, &config)
      .await
      .unwrap();
    assert_eq!(count, "42");
  }

  #[tokio::test]
  async fn missing_key_is_an_error() {
    let store = store();
    let config = Config::default();
    assert!(execute(Command::Get { key: "x".into() }, &store, &config)
      .await
      .is_err());
    assert!(execute(Command::Delete { key: "x".into() }, &store, &config)
      .await
      .is_err());
  }

  #[tokio::test]
  async fn keys_filter_by_prefix() {
    let store = store();
    let config = Config::default();
    for key in ["cache_a", "cache_b", "user"] {
      execute(set(key, "v", false), &store, &config).await.unwrap();
    }
    let keys = execute(
      Command::Keys {
        prefix: Some("cache_".into()),
      },
      &store,
      &config,
    )
    .await
    .unwrap();
    assert_eq!(keys, "cache_a\ncache_b");
  }

  #[tokio::test]
  async fn encrypt_decrypt_round_trip() {
    let store = store();
    let config = Config::default();
    let envelope = execute(
      Command::Encrypt {
        text: "secret".into(),
      },
      &store,
      &config,
    )
    .await
    .unwrap();
    let plain = execute(Command::Decrypt { envelope }, &store, &config)
      .await
      .unwrap();
    assert_eq!(plain, "secret");
  }

  #[tokio::test]
  async fn export_and_import_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.json");
    let config = Config::default();

    let source = store();
    execute(set("a", "1", false), &source, &config).await.unwrap();
    execute(
      Command::Export {
        output: Some(path.clone()),
      },
      &source,
      &config,
    )
    .await
    .unwrap();

    let target = store();
    let message = execute(Command::Import { path }, &target, &config)
      .await
      .unwrap();
    assert_eq!(message, "Imported 1 entries");
    assert_eq!(target.get("a").unwrap(), Some(StoreValue::from("1")));
  }

  #[tokio::test]
  async fn queue_list_and_clear() {
    let store = store();
    let config = Config::default();
    {
      let queue = RequestQueue::new(store.clone(), &config.queue);
      queue.enqueue(nexus_store::api::ApiRequest::get("/feed"));
    }

    let listing = execute(
      Command::Queue {
        action: QueueAction::List,
      },
      &store,
      &config,
    )
    .await
    .unwrap();
    assert!(listing.contains("GET"));
    assert!(listing.contains("/feed"));

    let cleared = execute(
      Command::Queue {
        action: QueueAction::Clear,
      },
      &store,
      &config,
    )
    .await
    .unwrap();
    assert_eq!(cleared, "Removed 1 queued requests");
  }

  #[test]
  fn parses_value_kinds() {
    assert_eq!(
      parse_value("true", true, false).unwrap(),
      StoreValue::Boolean(true)
    );
    assert!(matches!(
      parse_value("2024-01-02T03:04:05Z", false, true).unwrap(),
      StoreValue::Date(_)
    ));
    assert_eq!(parse_value("42", false, false).unwrap(), StoreValue::from("42"));
    assert!(parse_value("{", true, false).is_err());
    assert!(parse_value("null", true, false).is_err());
  }

  #[test]
  fn renders_whole_numbers_without_fraction() {
    assert_eq!(render(&StoreValue::Number(3.0)), "3");
    assert_eq!(render(&StoreValue::Number(2.5)), "2.5");
  }
}
