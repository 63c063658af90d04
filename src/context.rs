use crate::config::AppConfig;
use tokio_util::sync::CancellationToken;

/// Shared, read-only state handed to each command.
#[derive(Clone)]
pub struct AppContext {
    pub config: std::sync::Arc<AppConfig>,
    /// Fired on Ctrl-C; in-flight operations abandon their work when it trips.
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: std::sync::Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}
