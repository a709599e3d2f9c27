use crate::api::LLMApiProvider;
use crate::config::Settings;
use crate::files::FileStore;
use crate::storage::StorageManager;
use crate::stream::StreamManager;
use crate::tools::ToolRegistry;
use dashmap::DashMap;
use std::sync::Arc;

// Core application state shared by every request handler
pub struct AppState {
    // SqlitePool is already a shared handle, no Mutex needed
    pub storage: StorageManager,
    pub api_provider: Arc<dyn LLMApiProvider>,
    pub files: FileStore,
    pub streams: Arc<StreamManager>,
    pub cancelled_streams: Arc<DashMap<String, bool>>, // stream ids asked to stop
    pub tools: ToolRegistry,
    pub settings: Settings,
}

impl AppState {
    pub fn new(
        storage: StorageManager,
        api_provider: Arc<dyn LLMApiProvider>,
        files: FileStore,
        tools: ToolRegistry,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            api_provider,
            files,
            streams: StreamManager::new(),
            cancelled_streams: Arc::new(DashMap::new()),
            tools,
            settings,
        })
    }
}
