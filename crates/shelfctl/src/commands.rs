//! Command implementations. Entries are printed as one JSON object per line.

use crate::cli::{BlobCommands, Commands, DocCommands, FilterArgs, RetainArgs};
use crate::config::Config;
use crate::error::{Result, ShelfctlError};
use chrono::Utc;
use futures::TryStreamExt;
use serde::Serialize;
use shelf_db::{
    run_cycle, BlobStore, CancellationToken, DocumentStore, LikeExpr, ListFilter,
    NamespaceFilter, RetentionEngine, RetentionOptions, RetentionRule, RetentionTarget,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

pub async fn run(command: Commands, config: &Config, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Doc { command } => {
            let store = open_documents(config).await?;
            let result = doc(&store, command, out).await;
            store.close().await;
            result
        }
        Commands::Blob { command } => {
            let store = open_blobs(config).await?;
            blob(&store, command, out).await
        }
        Commands::Flush { force } => {
            let docs = open_documents(config).await?;
            docs.flush(force).await?;
            docs.close().await;
            open_blobs(config).await?.flush(force).await?;
            info!("Flushed both stores (force: {})", force);
            Ok(())
        }
        Commands::Compact => {
            let docs = open_documents(config).await?;
            docs.compact().await;
            docs.close().await;
            open_blobs(config).await?.compact().await;
            info!("Compacted both stores");
            Ok(())
        }
        Commands::Retain(args) => {
            let rule = retention_rule(&args)?;
            if args.blobs {
                retain(open_blobs(config).await?, rule, &args, out).await
            } else {
                retain(open_documents(config).await?, rule, &args, out).await
            }
        }
    }
}

async fn open_documents(config: &Config) -> Result<DocumentStore> {
    debug!("Opening document store at {:?}", config.doc_db);
    Ok(DocumentStore::open_with(&config.doc_db, config.store.clone()).await?)
}

async fn open_blobs(config: &Config) -> Result<BlobStore> {
    debug!("Opening blob store at {:?}", config.blob_db);
    Ok(BlobStore::open_with(&config.blob_db, config.store.clone()).await?)
}

fn print_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn list_filter(filter: FilterArgs) -> ListFilter {
    ListFilter {
        key_pattern: filter.pattern.map(LikeExpr::from),
        from: filter.range.from,
        to: filter.range.to,
    }
}

async fn doc(store: &DocumentStore, command: DocCommands, out: &mut impl Write) -> Result<()> {
    match command {
        DocCommands::Put {
            namespace,
            key,
            value,
        } => {
            let raw = match value {
                Some(value) => value,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin().read_to_string(&mut buf).await?;
                    buf
                }
            };
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            let entry = store.write(&namespace, &key, &value).await?;
            print_json(out, &entry)
        }
        DocCommands::Get { namespace, key } => match store.read(&namespace, &key).await? {
            Some(entry) => print_json(out, &entry),
            None => Err(ShelfctlError::NotFound { namespace, key }),
        },
        DocCommands::Ls {
            namespace,
            filter,
            meta,
        } => {
            let filter = list_filter(filter);
            if meta {
                let mut entries =
                    store.list_meta(NamespaceFilter::Exact(namespace), filter);
                while let Some(entry) = entries.try_next().await? {
                    print_json(out, &entry)?;
                }
            } else {
                let mut entries = store.list(&namespace, filter);
                while let Some(entry) = entries.try_next().await? {
                    print_json(out, &entry)?;
                }
            }
            Ok(())
        }
        DocCommands::Rm {
            namespace,
            key,
            range,
        } => {
            let removed = store
                .delete(&namespace, key.as_deref(), range.from, range.to)
                .await?;
            info!("Deleted {} documents from {}", removed, namespace);
            writeln!(out, "{}", removed)?;
            Ok(())
        }
        DocCommands::Count { namespace, pattern } => {
            let pattern = pattern.map(LikeExpr::from);
            let count = store.count(namespace.as_deref(), pattern.as_ref()).await?;
            writeln!(out, "{}", count)?;
            Ok(())
        }
    }
}

async fn blob(store: &BlobStore, command: BlobCommands, out: &mut impl Write) -> Result<()> {
    match command {
        BlobCommands::Put {
            namespace,
            key,
            file,
            len,
        } => {
            let meta = if file.as_os_str() == "-" {
                let len = len.ok_or_else(|| {
                    ShelfctlError::Usage("--len is required when reading from stdin".to_string())
                })?;
                put_from(store, &namespace, &key, tokio::io::stdin(), len).await?
            } else {
                let source = tokio::fs::File::open(&file).await?;
                let len = match len {
                    Some(len) => len,
                    None => source.metadata().await?.len(),
                };
                put_from(store, &namespace, &key, source, len).await?
            };
            print_json(out, &meta)
        }
        BlobCommands::Get {
            namespace,
            key,
            out: path,
        } => {
            let (meta, reader) = store
                .read(&namespace, &key)
                .await?
                .ok_or(ShelfctlError::NotFound { namespace, key })?;
            let copied = copy_payload(reader, path).await?;
            info!("Copied {} of {} bytes from {}/{}", copied, meta.raw_length, meta.namespace, meta.key);
            Ok(())
        }
        BlobCommands::Ls {
            namespace,
            like,
            filter,
        } => {
            let namespace = match namespace {
                Some(ns) if like => NamespaceFilter::Like(LikeExpr::from(ns)),
                Some(ns) => NamespaceFilter::Exact(ns),
                None => NamespaceFilter::All,
            };
            let mut entries = store.list_meta(namespace, list_filter(filter));
            while let Some(entry) = entries.try_next().await? {
                print_json(out, &entry)?;
            }
            Ok(())
        }
        BlobCommands::Rm {
            namespace,
            key,
            range,
        } => {
            let removed = store
                .delete(&namespace, key.as_deref(), range.from, range.to)
                .await?;
            info!("Deleted {} blobs from {}", removed, namespace);
            writeln!(out, "{}", removed)?;
            Ok(())
        }
        BlobCommands::Count { namespace, pattern } => {
            let pattern = pattern.map(LikeExpr::from);
            let count = store.count(namespace.as_deref(), pattern.as_ref()).await?;
            writeln!(out, "{}", count)?;
            Ok(())
        }
    }
}

/// Stream `source` into the store, cancelling the copy on Ctrl-C
async fn put_from<R>(
    store: &BlobStore,
    namespace: &str,
    key: &str,
    source: R,
    len: u64,
) -> Result<shelf_db::BlobEntryMeta>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });
    let result = store.write(namespace, key, source, len, cancel).await;
    interrupt.abort();
    Ok(result?)
}

async fn copy_payload(mut reader: shelf_db::BlobReader, path: Option<PathBuf>) -> Result<u64> {
    let copied = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        match path {
            Some(path) => {
                let mut file = std::fs::File::create(&path)?;
                std::io::copy(&mut reader, &mut file)
            }
            None => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                let copied = std::io::copy(&mut reader, &mut lock)?;
                lock.flush()?;
                Ok(copied)
            }
        }
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(copied)
}

fn retention_rule(args: &RetainArgs) -> Result<RetentionRule> {
    let rule = match args.max_bytes {
        Some(max_bytes) => RetentionRule::total_size(args.namespace.as_str(), max_bytes),
        None if args.max_age_secs.is_some() || args.max_idle_secs.is_some() => RetentionRule::age(
            args.namespace.as_str(),
            args.max_age_secs.map(Duration::from_secs),
            args.max_idle_secs.map(Duration::from_secs),
        ),
        None => {
            return Err(ShelfctlError::Usage(
                "one of --max-age-secs, --max-idle-secs or --max-bytes is required".to_string(),
            ))
        }
    };
    Ok(match &args.pattern {
        Some(pattern) => rule.with_key_pattern(pattern.as_str()),
        None => rule,
    })
}

async fn retain<T>(
    target: T,
    rule: RetentionRule,
    args: &RetainArgs,
    out: &mut impl Write,
) -> Result<()>
where
    T: RetentionTarget,
    T::Meta: Serialize,
{
    if !args.watch {
        let deleted = run_cycle(&target, &[rule], Utc::now()).await;
        info!("Retention removed {} entries from {}", deleted.len(), args.namespace);
        for meta in &deleted {
            print_json(out, meta)?;
        }
        return Ok(());
    }

    let options = RetentionOptions::new(vec![rule])
        .with_scan_interval(Duration::from_secs(args.interval_secs))
        .on_deleted(|deleted| info!("Retention removed {} entries", deleted.len()));
    let handle = RetentionEngine::attach(Arc::new(target), options);
    info!(
        "Watching {} every {}s, press Ctrl-C to stop",
        args.namespace, args.interval_secs
    );
    tokio::signal::ctrl_c().await?;
    let status = handle.status();
    handle.shutdown().await;
    info!("Retention stopped after {} cycles", status.cycles);
    Ok(())
}
