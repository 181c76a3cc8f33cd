//! Process-wide wiring of the agent core
//!
//! [`AgentRuntime`] owns one lock table, one context store, one ledger and the
//! background tasks that serve them (lock sweeper, context backfill, lock
//! audit writer). Everything is built from a [`Config`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agents::{AgentExecutor, AgentResult, AgentScheduler, FeatureHandle, FeatureInput};
use crate::config::Config;
use crate::domain::context::{ContextItem, ContextRetriever, ContextStore, NewContextItem};
use crate::domain::execution::ExecutionLedger;
use crate::domain::locking::ResourceLockManager;
use crate::error::{Error, Result};
use crate::gateway::{ModelGateway, OpenRouterGateway, ScriptedGateway};
use crate::storage::{Database, SqliteContextRepository, SqliteExecutionStore, SqliteLockAudit};

/// Where the runtime keeps its durable state
#[derive(Debug, Clone, Default)]
enum Persistence {
    /// Open the database named by the configuration
    #[default]
    Configured,
    /// Use an already opened database
    Database(Database),
    /// Keep everything in process memory
    Ephemeral,
}

/// Builder for [`AgentRuntime`]
#[derive(Default)]
pub struct AgentRuntimeBuilder {
    config: Config,
    gateway: Option<Arc<dyn ModelGateway>>,
    offline: bool,
    persistence: Persistence,
}

impl AgentRuntimeBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use this gateway instead of building one from the configuration
    pub fn gateway(mut self, gateway: Arc<dyn ModelGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Answer model calls with the offline scripted gateway
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn database(mut self, database: Database) -> Self {
        self.persistence = Persistence::Database(database);
        self
    }

    /// Skip the database entirely
    pub fn ephemeral(mut self) -> Self {
        self.persistence = Persistence::Ephemeral;
        self
    }

    /// Wire every component and start the background tasks
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn build(self) -> Result<AgentRuntime> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| Error::ConfigError(format!("{:#}", e)))?;

        let database = match self.persistence {
            Persistence::Configured => Some(
                Database::new(config.database_config())
                    .await
                    .map_err(|e| Error::Store(format!("{:#}", e)))?,
            ),
            Persistence::Database(db) => Some(db),
            Persistence::Ephemeral => None,
        };

        let gateway: Arc<dyn ModelGateway> = match self.gateway {
            Some(gateway) => gateway,
            None if self.offline => Arc::new(ScriptedGateway::new()),
            None => Arc::new(openrouter_gateway(&config)?),
        };

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let execution_store = database
            .as_ref()
            .map(|db| Arc::new(SqliteExecutionStore::new(db.pool().clone())));
        let ledger = match &execution_store {
            Some(store) => ExecutionLedger::with_store(store.clone()),
            None => ExecutionLedger::new(),
        };

        let mut locks =
            ResourceLockManager::new(config.lock_config()).with_liveness(Arc::new(ledger.clone()));
        let lock_audit = match &database {
            Some(db) => {
                let (audit, writer) = SqliteLockAudit::spawn(db.pool().clone());
                tasks.push(writer);
                locks = locks.with_audit_sink(Arc::new(audit.clone()));
                Some(audit)
            }
            None => None,
        };
        tasks.push(locks.spawn_sweeper(shutdown.clone()));

        let context_repository = database
            .as_ref()
            .map(|db| Arc::new(SqliteContextRepository::new(db.pool().clone())));
        let mut store_builder = ContextStore::builder();
        if let Some(repo) = &context_repository {
            store_builder = store_builder.repository(repo.clone());
        }
        let context = store_builder.build();
        let restored = context.restore().await?;
        if config.context.background_backfill {
            tasks.push(context.spawn_backfill(shutdown.clone()));
        }

        let retriever = ContextRetriever::new(context.clone())
            .with_filter(config.injection_filter())
            .with_config(config.retriever_config());
        let executor = AgentExecutor::new(ledger.clone(), locks.clone(), retriever.clone(), gateway)
            .with_config(config.executor_config());
        let scheduler = AgentScheduler::new(executor).with_config(config.scheduler_config());

        info!(
            persistent = database.is_some(),
            offline = self.offline,
            context_items = restored,
            "Agent runtime started"
        );

        Ok(AgentRuntime {
            config,
            database,
            execution_store,
            lock_audit,
            ledger,
            locks,
            context,
            retriever,
            scheduler,
            shutdown,
            tasks,
        })
    }
}

fn openrouter_gateway(config: &Config) -> Result<OpenRouterGateway> {
    let api_key = config
        .llm
        .resolved_api_key()
        .map_err(|e| Error::ConfigError(format!("{:#}", e)))?
        .ok_or_else(|| {
            Error::ConfigError(
                "No API key found; set OPENROUTER_API_KEY or run offline".to_string(),
            )
        })?;
    OpenRouterGateway::builder()
        .config(config.llm.clone())
        .api_key(api_key)
        .build()
}

/// The running agent core
pub struct AgentRuntime {
    config: Config,
    database: Option<Database>,
    execution_store: Option<Arc<SqliteExecutionStore>>,
    lock_audit: Option<SqliteLockAudit>,
    ledger: ExecutionLedger,
    locks: ResourceLockManager,
    context: ContextStore,
    retriever: ContextRetriever,
    scheduler: AgentScheduler,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("persistent", &self.database.is_some())
            .field("executions", &self.ledger.len())
            .field("active_features", &self.scheduler.active())
            .finish()
    }
}

impl AgentRuntime {
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    pub fn execution_store(&self) -> Option<&SqliteExecutionStore> {
        self.execution_store.as_deref()
    }

    pub fn lock_audit(&self) -> Option<&SqliteLockAudit> {
        self.lock_audit.as_ref()
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    pub fn locks(&self) -> &ResourceLockManager {
        &self.locks
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn retriever(&self) -> &ContextRetriever {
        &self.retriever
    }

    pub fn scheduler(&self) -> &AgentScheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> &AgentExecutor {
        self.scheduler.executor()
    }

    /// Append a history item to the shared context store
    pub async fn add_context(&self, item: NewContextItem) -> Result<Arc<ContextItem>> {
        Ok(self.context.append(item).await?)
    }

    pub async fn start_feature(&self, feature: FeatureInput) -> Result<FeatureHandle> {
        self.scheduler.start_feature(feature).await
    }

    pub async fn run_feature(&self, feature: FeatureInput) -> Result<AgentResult> {
        self.scheduler.run_feature(feature).await
    }

    /// Stop the background tasks and close the database
    ///
    /// Queued lock audit records are written before the pool closes.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(audit) = &self.lock_audit {
            audit.flush().await?;
        }

        let AgentRuntime {
            database,
            lock_audit,
            locks,
            scheduler,
            context,
            retriever,
            tasks,
            ..
        } = self;
        drop((lock_audit, locks, scheduler, context, retriever));

        for task in tasks {
            if !task.is_finished() {
                task.abort();
            }
            let _ = task.await;
        }
        if let Some(db) = database {
            db.close().await;
        }
        debug!("Agent runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::SourceType;
    use crate::domain::execution::{ExecutionStatus, ExecutionStore};

    #[tokio::test]
    async fn test_ephemeral_offline_runtime_runs_a_feature() {
        let runtime = AgentRuntime::builder().offline(true).ephemeral().build().await.unwrap();
        assert!(runtime.database().is_none());

        runtime
            .add_context(NewContextItem::new(
                "proj",
                SourceType::Feature,
                "feat-0",
                "Existing signup flow stores users in Postgres",
            ))
            .await
            .unwrap();

        let result = runtime
            .run_feature(FeatureInput::new("proj", "feat-1", "Add password reset"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.worker_results().len(), 3);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_runtime_persists_to_database() {
        let db = Database::in_memory().await.unwrap();
        let runtime = AgentRuntime::builder()
            .offline(true)
            .database(db)
            .build()
            .await
            .unwrap();

        let result = runtime
            .run_feature(FeatureInput::new("proj", "feat-2", "Add audit log"))
            .await
            .unwrap();

        let store = runtime.execution_store().unwrap();
        let root = store.get(result.execution_id).await.unwrap().unwrap();
        assert_eq!(root.status, ExecutionStatus::Succeeded);

        let audit = runtime.lock_audit().unwrap();
        audit.flush().await.unwrap();
        assert!(!audit.list_recent(50).await.unwrap().is_empty());
        assert!(audit.list_held().await.unwrap().is_empty());

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_online_runtime_requires_api_key() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-in-config".into());
        let err = AgentRuntime::builder()
            .config(config)
            .ephemeral()
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
