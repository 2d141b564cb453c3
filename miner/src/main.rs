//! Mine one mailbox from the command line.
//!
//! Credentials come from the environment:
//! `MAILMINER_EMAIL`, `MAILMINER_HOST` (optional for Gmail/Outlook OAuth),
//! `MAILMINER_PASSWORD` or `MAILMINER_ACCESS_TOKEN`, and `MAILMINER_FOLDERS`
//! (comma separated, defaults to INBOX).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use mailminer::adapters::broker::{publish_json, Broker, InMemoryBroker};
use mailminer::adapters::imap::ImapSessionFactory;
use mailminer::adapters::sqlite::SqliteTaskStore;
use mailminer::credentials::{MiningSource, StaticCredentialStore};
use mailminer::services::fetch::{FetchService, LocalFetchService};
use mailminer::services::logger;
use mailminer::services::tasks::{uuid_ids, ChannelSink, MiningRequest, TasksManager};
use mailminer::types::{ProgressEvent, ProgressType, TaskStreams};
use mailminer::{MinerConfig, MinerError, Result};

const USER_ID: &str = "local";

#[tokio::main]
async fn main() {
    logger::init();

    if let Err(e) = run().await {
        error!(error = %e, fields = ?e.fields(), "Mining failed");
        std::process::exit(1);
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn source_from_env() -> Result<MiningSource> {
    let host = env("MAILMINER_HOST");
    let port = match env("MAILMINER_PORT") {
        Some(port) => port
            .parse()
            .map_err(|_| MinerError::config("MAILMINER_PORT is not a port", &["port"]))?,
        None => 993,
    };

    if let Some(access_token) = env("MAILMINER_ACCESS_TOKEN") {
        return Ok(MiningSource::OAuth {
            provider: None,
            host,
            access_token,
            refresh_token: env("MAILMINER_REFRESH_TOKEN"),
            expires_at: None,
        });
    }

    let password = env("MAILMINER_PASSWORD").ok_or_else(|| {
        MinerError::config(
            "Set MAILMINER_PASSWORD or MAILMINER_ACCESS_TOKEN",
            &["password", "accessToken"],
        )
    })?;
    let host =
        host.ok_or_else(|| MinerError::config("MAILMINER_HOST is required", &["host"]))?;
    Ok(MiningSource::Password {
        host,
        port,
        tls: env("MAILMINER_TLS").map_or(true, |v| v != "false"),
        password,
    })
}

/// The broker here is in-process, so a remote fetcher could never report
/// progress to it.
fn require_local_fetch(config: &MinerConfig) -> Result<()> {
    match &config.fetch_service.base_url {
        Some(base_url) => Err(MinerError::config(
            format!(
                "fetch_service.base_url ({}) needs a broker shared with the fetch service; \
                 this binary only runs the in-process fetcher",
                base_url
            ),
            &["base_url"],
        )),
        None => Ok(()),
    }
}

async fn run() -> Result<()> {
    let config = MinerConfig::load(None)?;
    require_local_fetch(&config)?;
    let email = env("MAILMINER_EMAIL")
        .ok_or_else(|| MinerError::config("MAILMINER_EMAIL is required", &["email"]))?;
    let boxes: Vec<String> = env("MAILMINER_FOLDERS")
        .map(|folders| {
            folders
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect()
        })
        .unwrap_or_else(|| vec!["INBOX".to_string()]);

    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let store = Arc::new(SqliteTaskStore::open(&config.database.path)?);
    info!("Task store at {:?}", config.database.path);

    let credentials = StaticCredentialStore::new();
    credentials.insert(USER_ID, &email, source_from_env()?);
    let fetch: Arc<dyn FetchService> = Arc::new(LocalFetchService::new(
        Arc::new(credentials),
        Arc::new(ImapSessionFactory),
        broker.clone(),
        config.imap.clone(),
        config.oauth.clone(),
    ));

    let manager = TasksManager::spawn(store, broker.clone(), fetch, uuid_ids());
    let task = manager
        .create_task(MiningRequest {
            user_id: USER_ID.to_string(),
            email,
            boxes,
            extract_signatures: true,
        })
        .await?;
    let mining_id = task.task_id.clone();
    info!(mining_id = %mining_id, total_messages = task.progress.total_messages, "Mining started");

    let (sink, events) = ChannelSink::channel();
    match manager.attach_sink(&mining_id, Arc::new(sink)).await {
        Ok(()) => {}
        Err(MinerError::NotFound(_)) => {
            info!(mining_id = %mining_id, "Mining finished before progress could be followed");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    let consumer = tokio::spawn(count_messages(broker.clone(), mining_id.clone()));

    while let Ok(event) = events.recv_async().await {
        info!(mining_id = %mining_id, event = %event.event, data = %event.data, "Progress");
    }
    consumer.abort();

    info!(mining_id = %mining_id, "Mining finished");
    Ok(())
}

/// Stand-in for the extraction workers: acknowledges every published
/// message so the pipeline can run to completion.
async fn count_messages(broker: Arc<dyn Broker>, mining_id: String) {
    let streams = TaskStreams::for_mining(&mining_id);
    loop {
        let mut read = 0u64;
        match broker
            .read_group(&streams.messages_stream, &streams.messages_group, 500)
            .await
        {
            Ok(entries) => read += entries.len() as u64,
            Err(e) => {
                debug!(mining_id = %mining_id, error = %e, "Messages stream gone");
                return;
            }
        }
        // Signatures are only drained here
        if let Err(e) = broker
            .read_group(&streams.signatures_stream, &streams.signatures_group, 500)
            .await
        {
            debug!(mining_id = %mining_id, error = %e, "Signatures stream gone");
        }

        if read == 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        let event = ProgressEvent {
            mining_id: mining_id.clone(),
            progress_type: ProgressType::Extracted,
            count: read,
            is_completed: false,
            is_canceled: false,
        };
        if let Err(e) = publish_json(broker.as_ref(), &mining_id, &event).await {
            warn!(mining_id = %mining_id, error = %e, "Failed to report extraction progress");
        }
    }
}
