use chrono::{DateTime, Duration, Utc};
use minijinja::Environment;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::agent::orchestrator::QueryOrchestrator;
use crate::agent::session::Session;
use crate::agent::state::UserContext;
use crate::config::AppConfig;
use crate::db::executor::QueryExecutor;
use crate::db::schema::SchemaMetadata;
use crate::web::templates::init_templates;

pub type SharedSession = Arc<Mutex<Session>>;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: QueryOrchestrator,
    pub executor: Arc<dyn QueryExecutor>,
    pub schema: SchemaMetadata,
    pub template_env: Environment<'static>,
    pub llm_description: String,
    // One lock per session: queries on a session serialise, sessions never contend
    pub sessions: RwLock<HashMap<Uuid, SharedSession>>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        orchestrator: QueryOrchestrator,
        executor: Arc<dyn QueryExecutor>,
        schema: SchemaMetadata,
        llm_description: String,
    ) -> Result<Self, minijinja::Error> {
        Ok(Self {
            config,
            orchestrator,
            executor,
            schema,
            template_env: init_templates()?,
            llm_description,
            sessions: RwLock::new(HashMap::new()),
            startup_time: Utc::now(),
        })
    }

    pub async fn create_session(&self, user: UserContext) -> (Uuid, SharedSession) {
        self.evict_idle(Utc::now()).await;
        let session = Session::new(user, self.config.agent.max_history);
        let id = session.id;
        let shared = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id, shared.clone());
        info!("Created session {}", id);
        (id, shared)
    }

    pub async fn session(&self, id: &Uuid) -> Option<SharedSession> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove_session(&self, id: &Uuid) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!("Closed session {}", id);
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drops sessions idle for longer than the configured TTL and returns how
    /// many went. A session whose lock is held is mid-request and stays.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let ttl = Duration::seconds(self.config.web.session_ttl_secs.min(u32::MAX as u64) as i64);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| match session.try_lock() {
            Ok(session) if now - session.last_active > ttl => {
                info!("Expired idle session {}", id);
                false
            }
            _ => true,
        });
        before - sessions.len()
    }
}
