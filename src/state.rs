//! Shared application state.

use std::path::PathBuf;
use std::sync::Arc;

use crate::session::SessionManager;
use crate::workspace::WorkspacePipeline;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub workspaces: Arc<WorkspacePipeline>,
}

impl AppState {
    pub fn new(claude_bin: Option<PathBuf>, workspace_root: PathBuf) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(claude_bin)),
            workspaces: Arc::new(WorkspacePipeline::new(workspace_root)),
        }
    }
}
