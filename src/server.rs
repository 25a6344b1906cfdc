// Server assembly: shared context, single-instance service lock, startup
// order and the accept loop on the local socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache_cleaner::CacheCleaner;
use crate::config::{Instance, ServerConfig};
use crate::notification::NotificationBus;
use crate::resource_manager::ResourceManager;
use crate::search::SearchManager;
use crate::session::serve_connection;
use crate::storage::datastore::DataStore;
use crate::storage::db::Database;
use crate::storage::part_helper::PartHelper;
use crate::storage::schema::DbInitializer;

/// Everything shared between sessions and workers. Database connections
/// are NOT in here; every session and worker opens its own.
pub struct ServerContext {
    pub config: ServerConfig,
    pub instance: Instance,
    db_path: PathBuf,
    payload_dir: PathBuf,
    pub bus: Arc<NotificationBus>,
    pub resources: Arc<ResourceManager>,
    pub search: Arc<SearchManager>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, instance: Instance) -> Self {
        let db_path = instance.database_file();
        let payload_dir = instance.payload_dir();
        Self::with_paths(config, instance, db_path, payload_dir)
    }

    /// Explicit paths, used by tests to point everything at a scratch dir.
    pub fn with_paths(
        config: ServerConfig,
        instance: Instance,
        db_path: PathBuf,
        payload_dir: PathBuf,
    ) -> Self {
        let bus = Arc::new(NotificationBus::new());
        let spool_dir = db_path
            .parent()
            .map(|p| p.join("change_replay"))
            .unwrap_or_else(|| PathBuf::from("change_replay"));
        let resources = Arc::new(ResourceManager::new(spool_dir));
        let search = Arc::new(SearchManager::new(
            &config.search.engines,
            resources.clone(),
            Duration::from_secs(config.retrieval.timeout_secs),
        ));
        Self {
            config,
            instance,
            db_path,
            payload_dir,
            bus,
            resources,
            search,
        }
    }

    /// Opens a fresh connection-backed store for one session or worker.
    pub fn open_store(&self, session_id: Vec<u8>) -> Result<DataStore> {
        let db = Database::open(&self.db_path)?;
        Ok(DataStore::new(db, self.bus.clone(), session_id))
    }

    pub fn part_helper(&self) -> PartHelper {
        PartHelper::new(self.payload_dir.clone(), self.config.size_threshold())
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.config.retrieval.timeout_secs)
    }
}

/// Exclusive per-user lock guaranteeing a single server instance. Held as
/// a pid file in the runtime dir; released on drop.
pub struct ServiceLock {
    path: PathBuf,
}

const LOCK_ATTEMPTS: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

impl ServiceLock {
    pub async fn acquire(instance: &Instance) -> Result<Self> {
        let path = instance.lock_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create runtime directory {}", parent.display())
            })?;
        }
        for attempt in 0..LOCK_ATTEMPTS {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::holder_is_dead(&path) {
                        warn!(path = %path.display(), "removing stale service lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if attempt + 1 == LOCK_ATTEMPTS {
                        break;
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(crate::error::Error::Lock(format!(
                        "cannot create lock file {}: {e}",
                        path.display()
                    ))
                    .into())
                }
            }
        }
        Err(crate::error::Error::Lock(format!(
            "another server instance holds {}",
            path.display()
        ))
        .into())
    }

    fn holder_is_dead(path: &std::path::Path) -> bool {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return false;
        };
        let Ok(pid) = raw.trim().parse::<u32>() else {
            // unreadable pid: treat as stale
            return true;
        };
        !std::path::Path::new(&format!("/proc/{pid}")).exists()
    }
}

impl Drop for ServiceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Server {
    context: Arc<ServerContext>,
    listener: UnixListener,
    _lock: ServiceLock,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Startup order: service lock, database open plus schema, payload
    /// sweep, background workers, listener. Any failure here is fatal.
    pub async fn start(config: ServerConfig, instance: Instance) -> Result<Self> {
        let lock = ServiceLock::acquire(&instance).await?;
        let context = Arc::new(ServerContext::new(config, instance));

        // bootstrap connection: schema init and the stale-payload sweep
        let bootstrap = context.open_store(b"server-bootstrap".to_vec())?;
        DbInitializer::new(bootstrap.db()).run()?;
        let swept = context.part_helper().sweep_orphans(bootstrap.db())?;
        if swept > 0 {
            info!(files = swept, "removed stale payload files");
        }
        drop(bootstrap);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if context.config.cache_cleaner.enabled {
            let cleaner_store = context.open_store(b"cache-cleaner".to_vec())?;
            let cleaner = CacheCleaner::new(cleaner_store, context.part_helper());
            tokio::spawn(cleaner.run(shutdown_rx.clone()));
        }
        tokio::spawn(context.resources.clone().run_spooler(context.bus.clone()));

        let socket_path = context.instance.socket_file(&context.config);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory {}", parent.display())
            })?;
        }
        // a leftover socket from a previous run would fail the bind
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("Failed to remove stale socket {}", socket_path.display())
            })?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        info!(socket = %socket_path.display(), "server listening");

        Ok(Self {
            context,
            listener,
            _lock: lock,
            shutdown_tx,
        })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }

    /// Accepts connections until ctrl-c.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let context = self.context.clone();
                            tokio::spawn(async move {
                                serve_connection(context, stream).await;
                            });
                        }
                        Err(e) => bail!("accept failed: {e}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    let _ = self.shutdown_tx.send(true);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_instance(dir: &std::path::Path, name: &str) -> Instance {
        std::env::set_var("XDG_RUNTIME_DIR", dir);
        Instance::new(Some(format!("{name}-{}", std::process::id())))
    }

    #[tokio::test]
    async fn service_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let instance = scratch_instance(dir.path(), "lock");

        let lock = ServiceLock::acquire(&instance).await.unwrap();
        let path = instance.lock_file();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
        // re-acquire after release works
        let _lock = ServiceLock::acquire(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn stale_lock_from_dead_process_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let instance = scratch_instance(dir.path(), "stale");
        let path = instance.lock_file();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // far beyond any real pid, so the holder counts as dead
        std::fs::write(&path, "999999999").unwrap();
        let _lock = ServiceLock::acquire(&instance).await.unwrap();
    }
}
