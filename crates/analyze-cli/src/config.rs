use analysis_orchestrator::OrchestratorConfig;
use anyhow::{bail, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` means no key was configured (or `--demo` was passed): use the demo dataset
    pub polygon_api_key: Option<String>,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    pub fn from_env(force_demo: bool) -> Result<Self> {
        let polygon_api_key = env::var("POLYGON_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .filter(|_| !force_demo);

        // Read by PolygonClient itself; validated here so a typo fails at startup
        if let Ok(limit) = env::var("POLYGON_RATE_LIMIT") {
            match limit.parse::<usize>() {
                Ok(0) | Err(_) => bail!("POLYGON_RATE_LIMIT must be a positive integer, got {:?}", limit),
                Ok(_) => {}
            }
        }

        Ok(Self {
            polygon_api_key,
            orchestrator: OrchestratorConfig::default(),
        })
    }
}
