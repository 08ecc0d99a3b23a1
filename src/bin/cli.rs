//! memvault CLI
//!
//! Operator tool: inspect a store, run the startup migration by hand, and
//! poke at memories and clusters.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memvault::config::{
    BackendConfig, EmbeddingConfig, EncryptionConfig, PostgresConfig, QueueConfig, SqliteConfig,
    StorageMode, VaultConfig,
};
use memvault::types::{
    AddMemoryInput, AddMemoryOutcome, ClusterQuery, CreateClusterInput, DeleteMemoriesInput,
    DetailInput, MemoryFilter, MemoryQuery, MemorySortField,
};
use memvault::VaultStore;

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    Sqlite,
    Postgres,
}

#[derive(Parser)]
#[command(name = "memvault")]
#[command(about = "Durable memory storage CLI")]
#[command(version)]
struct Cli {
    /// Storage backend
    #[arg(long, env = "MEMVAULT_BACKEND", value_enum, default_value = "sqlite")]
    backend: BackendKind,

    /// Database path (sqlite backend)
    #[arg(long, env = "MEMVAULT_DB_PATH")]
    db_path: Option<String>,

    /// Storage mode: local or cloud-safe (sqlite backend)
    #[arg(long, env = "MEMVAULT_STORAGE_MODE", default_value = "local")]
    storage_mode: StorageMode,

    /// Connection URL (postgres backend)
    #[arg(long, env = "MEMVAULT_POSTGRES_URL")]
    postgres_url: Option<String>,

    /// Encrypt record content at rest
    #[arg(long, env = "MEMVAULT_ENCRYPT")]
    encrypt: bool,

    /// Directory holding public.key and private.key
    #[arg(long, env = "MEMVAULT_KEY_DIR")]
    key_dir: Option<String>,

    /// Embedding model: tfidf, openai or none
    #[arg(long, env = "MEMVAULT_EMBEDDING_MODEL", default_value = "tfidf")]
    embedding_model: String,

    /// API key for OpenAI-compatible embeddings
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Write-ahead log path
    #[arg(long, env = "MEMVAULT_WAL_PATH")]
    wal_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend, schema and capability information
    Info,
    /// Show record counts
    Stats,
    /// Store a memory
    Add {
        /// Content to remember
        content: String,
        /// Tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
        /// Context label
        #[arg(short, long)]
        context: Option<String>,
        /// Importance (1-10)
        #[arg(short, long)]
        importance: Option<i64>,
    },
    /// Search memories by substring and tags
    Search {
        query: String,
        /// Filter by tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Sort by importance instead of time
        #[arg(long)]
        by_importance: bool,
    },
    /// Most recent memories
    Recent {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Delete memories matching a filter
    Delete {
        /// Memory ID
        #[arg(long)]
        id: Option<String>,
        /// Filter by tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
        /// Content substring
        #[arg(short, long)]
        query: Option<String>,
        /// Allow deleting everything when no filter is given
        #[arg(long)]
        force: bool,
    },
    /// Run schema migration and backfill, then print the report
    Migrate,
    /// Create a details cluster
    ClusterCreate {
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Initial details as key=value (repeatable)
        #[arg(long = "detail")]
        details: Vec<String>,
    },
    /// Show one cluster, or list clusters when no ID is given
    ClusterShow { id: Option<String> },
    /// Link a memory to a cluster
    Link { memory_id: String, cluster_id: String },
}

fn split_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

impl Cli {
    fn vault_config(&self) -> anyhow::Result<VaultConfig> {
        let backend = match self.backend {
            BackendKind::Sqlite => {
                let mut sqlite = SqliteConfig {
                    storage_mode: self.storage_mode,
                    ..Default::default()
                };
                if let Some(path) = &self.db_path {
                    sqlite.db_path = path.clone();
                }
                BackendConfig::Sqlite(sqlite)
            }
            BackendKind::Postgres => {
                let Some(url) = self.postgres_url.clone() else {
                    bail!("--postgres-url (or MEMVAULT_POSTGRES_URL) is required for the postgres backend");
                };
                BackendConfig::Postgres(PostgresConfig {
                    url,
                    max_connections: 5,
                    acquire_timeout_secs: 10,
                })
            }
        };

        let mut encryption = EncryptionConfig {
            enabled: self.encrypt,
            ..Default::default()
        };
        if let Some(dir) = &self.key_dir {
            encryption.key_dir = dir.clone();
        }

        let embedding = EmbeddingConfig {
            model: self.embedding_model.clone(),
            api_key: self.openai_api_key.clone(),
            ..Default::default()
        };

        let mut queue = QueueConfig::default();
        if let Some(path) = &self.wal_path {
            queue.wal_path = path.clone();
        }

        Ok(VaultConfig {
            backend,
            encryption,
            embedding,
            queue,
        })
    }
}

fn parse_detail(raw: &str) -> anyhow::Result<DetailInput> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("detail '{}' must look like key=value", raw);
    };
    Ok(DetailInput {
        key: key.to_string(),
        value: value.to_string(),
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.vault_config()?;
    let (store, report) = VaultStore::bootstrap(config)
        .await
        .context("failed to open storage")?;

    match cli.command {
        Commands::Info => {
            let info = store.storage_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Stats => {
            let stats = store.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Add {
            content,
            tags,
            context,
            importance,
        } => {
            let input = AddMemoryInput {
                content,
                tags: split_tags(tags),
                context,
                importance,
                ..Default::default()
            };
            match store.add_memory(input).await? {
                AddMemoryOutcome::Stored(memory) => {
                    println!("Stored memory {}", memory.id);
                    println!("{}", serde_json::to_string_pretty(&memory)?);
                }
                AddMemoryOutcome::Queued { queued_at } => {
                    println!("Queued at {} (storage not ready)", queued_at);
                }
            }
        }

        Commands::Search {
            query,
            tags,
            limit,
            by_importance,
        } => {
            let memories = store
                .search_memories(MemoryQuery {
                    query: Some(query),
                    tags: split_tags(tags),
                    limit: Some(limit),
                    sort_by: if by_importance {
                        MemorySortField::Importance
                    } else {
                        MemorySortField::Timestamp
                    },
                    ..Default::default()
                })
                .await?;
            for memory in memories {
                println!(
                    "{} [{}] {} - {}",
                    memory.id,
                    memory.importance.get(),
                    memory.tags.join(", "),
                    truncate(&memory.content, 60)
                );
            }
        }

        Commands::Recent { limit } => {
            for memory in store.get_recent_memories(limit).await? {
                println!(
                    "{} {} - {}",
                    memory.timestamp.format("%Y-%m-%d %H:%M"),
                    memory.id,
                    truncate(&memory.content, 60)
                );
            }
        }

        Commands::Delete {
            id,
            tags,
            query,
            force,
        } => {
            let deleted = store
                .delete_memories(DeleteMemoriesInput {
                    filter: MemoryFilter {
                        id,
                        tags: split_tags(tags),
                        query,
                        ..Default::default()
                    },
                    force,
                })
                .await?;
            println!("Deleted {} memories", deleted);
        }

        Commands::Migrate => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::ClusterCreate {
            name,
            description,
            details,
        } => {
            let details = details
                .iter()
                .map(|raw| parse_detail(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let cluster = store
                .create_cluster(CreateClusterInput {
                    name,
                    description,
                    details,
                    ..Default::default()
                })
                .await?;
            println!("Created cluster {}", cluster.id);
            println!("{}", serde_json::to_string_pretty(&cluster)?);
        }

        Commands::ClusterShow { id: Some(id) } => {
            let Some(cluster) = store.get_cluster(&id).await? else {
                bail!("cluster {} not found", id);
            };
            let members = store.get_memories_by_cluster(&id).await?;
            println!("{}", serde_json::to_string_pretty(&cluster)?);
            println!("{} linked memories", members.len());
            for memory in members {
                println!("  {} - {}", memory.id, truncate(&memory.content, 60));
            }
        }

        Commands::ClusterShow { id: None } => {
            for cluster in store.list_clusters(ClusterQuery::default()).await? {
                println!(
                    "{} {} ({} details)",
                    cluster.id,
                    cluster.name,
                    cluster.details.len()
                );
            }
        }

        Commands::Link {
            memory_id,
            cluster_id,
        } => {
            let memory = store.link_memory_to_cluster(&memory_id, &cluster_id).await?;
            println!("Linked {} -> {}", memory.id, cluster_id);
        }
    }

    store.close().await?;
    Ok(())
}
