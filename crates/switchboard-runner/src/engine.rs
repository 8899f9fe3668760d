//! Shared gateway state.
//!
//! One `Engine` is created at startup and handed to every handler as
//! `Arc<Engine>`. All mutation happens on the HTTP and child-close paths;
//! teardown cancels the shutdown token and terminates tracked children.

use tokio_util::sync::CancellationToken;
use tracing::info;

use switchboard_core::config::SwitchboardConfig;
use switchboard_sessions::identity::AliasMap;
use switchboard_sessions::store::SessionStore;
use switchboard_sessions::SessionRegistry;

use crate::error::Result;
use crate::monitor::MonitorHub;
use crate::queue::{ActiveRuns, SessionQueues};
use crate::supervisor::ChildTracker;

pub struct Engine {
    pub config: SwitchboardConfig,
    pub registry: SessionRegistry,
    pub store: SessionStore,
    pub aliases: AliasMap,
    pub queues: SessionQueues,
    pub active: ActiveRuns,
    pub monitor: MonitorHub,
    pub children: ChildTracker,
    pub shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: SwitchboardConfig) -> Result<Self> {
        let registry = SessionRegistry::open(
            config.sessions.store_path.as_deref(),
            config.sessions.ttl_secs,
        )?;
        let store = SessionStore::new(&config.cli.config_dir, &config.cli.workspace_dir);
        let aliases = AliasMap::load(config.sessions.alias_map_path.as_deref());
        if !aliases.is_empty() {
            info!(aliases = aliases.len(), "identity aliases active");
        }
        Ok(Self {
            config,
            registry,
            store,
            aliases,
            queues: SessionQueues::new(),
            active: ActiveRuns::new(),
            monitor: MonitorHub::new(),
            children: ChildTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Begin teardown: every in-flight run's kill token is a child of the
    /// shutdown token, so cancelling it funnels all children through the
    /// normal close path; `terminate_all` is the direct SIGTERM backstop.
    pub fn begin_shutdown(&self) {
        info!(children = self.children.len(), "gateway shutting down");
        self.shutdown.cancel();
        self.children.terminate_all();
    }
}
