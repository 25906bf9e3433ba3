use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use stormsync_common::{DEFAULT_HOST, DEFAULT_PORT, MAX_CONNECTIONS};
use stormsync_coord::{CacheConfig, Client, ClientConfig, LockConfig, QueueConfig, RawCodec};
use stormsync_storage::{RespConfig, RespStore};

#[derive(Parser, Debug)]
#[command(name = "stormsync", about = "Locks, caches e filas sobre Redis")]
struct Args {
    #[arg(long, default_value = DEFAULT_HOST, global = true)]
    host: String,
    #[arg(long, short, default_value_t = DEFAULT_PORT, global = true)]
    port: u16,
    #[arg(long, global = true)]
    password: Option<String>,
    /// Prefixo aplicado a todas as chaves
    #[arg(long, default_value = "", global = true)]
    prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Adquire um lock, segura por um tempo renovando o lease e libera
    Lock {
        name: String,
        #[arg(long, default_value_t = 1_000)]
        hold_ms: u64,
        #[arg(long, default_value_t = 5_000)]
        lease_ms: u64,
        #[arg(long, default_value_t = 30_000)]
        wait_ms: u64,
    },
    /// Coloca um payload (texto) na fila
    Enqueue {
        queue: String,
        payload: String,
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Retira e imprime itens até a fila esvaziar
    Drain {
        queue: String,
        #[arg(long, default_value_t = 100)]
        max: usize,
    },
    /// Tamanhos das partes de uma fila
    QueueStats { queue: String },
    CacheSet {
        cache: String,
        key: String,
        value: String,
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    CacheGet { cache: String, key: String },
    CacheKeys { cache: String },
    /// Remove marcadores de debounce sem uso
    MarkersClean {
        #[arg(long, default_value_t = 86_400)]
        older_than_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stormsync=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = RespConfig::new(format!("{}:{}", args.host, args.port))
        .with_max_connections(MAX_CONNECTIONS);
    if let Some(password) = args.password {
        config = config.with_password(password);
    }

    let store = RespStore::connect(config).await?;
    let client = Client::with_config(
        Arc::new(store),
        ClientConfig::default().with_prefix(args.prefix),
    );

    run(&client, args.command).await
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Lock {
            name,
            hold_ms,
            lease_ms,
            wait_ms,
        } => {
            let lock = client.lock(
                &name,
                LockConfig::default()
                    .with_wait_time(Duration::from_millis(lease_ms))
                    .with_max_wait(Duration::from_millis(wait_ms)),
            );
            lock.acquire().await?;
            info!("lock '{name}' adquirido");

            let refresher = lock.start_refresh_loop();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => {}
                _ = signal::ctrl_c() => info!("interrompido, liberando lock"),
            }
            refresher.stop().await;
            lock.release().await?;
            info!("lock '{name}' liberado");
        }
        Command::Enqueue {
            queue,
            payload,
            delay_ms,
        } => {
            let queue = client.queue_with_codec::<String, RawCodec>(&queue, QueueConfig::default());
            match delay_ms {
                Some(ms) => {
                    queue
                        .enqueue_delayed(&payload, Duration::from_millis(ms))
                        .await?
                }
                None => queue.enqueue(&payload).await?,
            }
        }
        Command::Drain { queue, max } => {
            let queue = client.queue_with_codec::<String, RawCodec>(&queue, QueueConfig::default());
            let mut drained = 0;
            while drained < max {
                let Some(item) = queue.dequeue().await? else {
                    break;
                };
                println!("{item}");
                drained += 1;
            }
            if drained == max && !queue.is_empty().await? {
                warn!("limite de {max} itens atingido; ainda há itens na fila");
            }
        }
        Command::QueueStats { queue } => {
            let queue = client.queue_with_codec::<String, RawCodec>(&queue, QueueConfig::default());
            println!("ready:      {}", queue.len().await?);
            println!("delayed:    {}", queue.delayed_len().await?);
            println!("processing: {}", queue.processing_len().await?);
        }
        Command::CacheSet {
            cache,
            key,
            value,
            ttl_ms,
        } => {
            let cache = text_cache(client, &cache);
            cache
                .set(&key, &value, ttl_ms.map(Duration::from_millis))
                .await?;
        }
        Command::CacheGet { cache, key } => match text_cache(client, &cache).get(&key).await? {
            Some(value) => println!("{value}"),
            None => println!("(nil)"),
        },
        Command::CacheKeys { cache } => {
            for key in text_cache(client, &cache).keys().await? {
                println!("{key}");
            }
        }
        Command::MarkersClean { older_than_secs } => {
            let removed = client
                .markers()
                .clean(Duration::from_secs(older_than_secs))
                .await?;
            println!("{removed} marcadores removidos");
        }
    }
    Ok(())
}

fn text_cache(client: &Client, name: &str) -> stormsync_coord::Cache<String, RawCodec> {
    client.cache_with_codec(name, CacheConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use stormsync_storage::{KeyValueStore, MemoryStore};

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn global_options_after_subcommand() {
        let args = Args::try_parse_from([
            "stormsync",
            "enqueue",
            "mail",
            "hello",
            "--delay-ms",
            "250",
            "--prefix",
            "app:",
        ])
        .unwrap();
        assert_eq!(args.prefix, "app:");
        assert_eq!(args.port, DEFAULT_PORT);
        match args.command {
            Command::Enqueue {
                queue,
                payload,
                delay_ms,
            } => {
                assert_eq!(queue, "mail");
                assert_eq!(payload, "hello");
                assert_eq!(delay_ms, Some(250));
            }
            other => panic!("comando inesperado: {other:?}"),
        }
    }

    #[test]
    fn lock_defaults() {
        let args = Args::try_parse_from(["stormsync", "lock", "job"]).unwrap();
        match args.command {
            Command::Lock {
                hold_ms,
                lease_ms,
                wait_ms,
                ..
            } => assert_eq!((hold_ms, lease_ms, wait_ms), (1_000, 5_000, 30_000)),
            other => panic!("comando inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn commands_run_against_memory_store() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let client = Client::new(store.clone());

        run(
            &client,
            Command::Enqueue {
                queue: "mail".into(),
                payload: "hi".into(),
                delay_ms: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(store.llen("queue:mail").await.unwrap(), 1);

        run(
            &client,
            Command::Drain {
                queue: "mail".into(),
                max: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(store.llen("queue:mail").await.unwrap(), 0);

        run(
            &client,
            Command::CacheSet {
                cache: "pages".into(),
                key: "home".into(),
                value: "<html>".into(),
                ttl_ms: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            store.hget("cache:pages:data", "home").await.unwrap(),
            Some(bytes::Bytes::from("<html>"))
        );

        run(
            &client,
            Command::Lock {
                name: "job".into(),
                hold_ms: 10,
                lease_ms: 100,
                wait_ms: 100,
            },
        )
        .await
        .unwrap();
        assert!(!store.exists("lock:job").await.unwrap());
    }
}
