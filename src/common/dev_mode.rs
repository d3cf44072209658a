use directories::ProjectDirs;
use std::fs;
use std::path::PathBuf;

use crate::common::config::Config;
use crate::common::error::{FaceGateError, Result};

const DEV_BASE_DIR: &str = "./dev_data";
const AUDIT_LOG_DIR: &str = "security_logs";
const AUDIT_LOG_FILE: &str = "auth_log.txt";

/// Resolves where identities, samples, the model and the security log live.
///
/// Development mode keeps everything under `./dev_data` so a checkout can be
/// exercised without touching the user's real enrollment data.
#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        let base_dir = if enabled {
            PathBuf::from(DEV_BASE_DIR)
        } else {
            let dirs = ProjectDirs::from("com", "facegate", "FaceGate")
                .ok_or_else(|| FaceGateError::Persistence("Failed to get project dirs".into()))?;
            dirs.data_dir().to_path_buf()
        };

        if enabled {
            fs::create_dir_all(base_dir.join("debug"))?;
            tracing::debug!("Development mode enabled, data goes to {}", base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn data_dir(&self, config: &Config) -> PathBuf {
        config
            .storage
            .data_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.clone())
    }

    pub fn audit_log_path(&self, config: &Config) -> PathBuf {
        config
            .storage
            .audit_log
            .clone()
            .unwrap_or_else(|| self.data_dir(config).join(AUDIT_LOG_DIR).join(AUDIT_LOG_FILE))
    }

    pub fn get_capture_path(&self, prefix: &str) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        if self.enabled {
            self.base_dir.join("debug").join(format!("{}_{}.png", prefix, timestamp))
        } else {
            PathBuf::from(format!("{}_{}.png", prefix, timestamp))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_overrides_win() {
        let dev = DevMode { enabled: false, base_dir: PathBuf::from("/base") };
        let mut config = Config::default();
        assert_eq!(dev.data_dir(&config), PathBuf::from("/base"));
        assert_eq!(
            dev.audit_log_path(&config),
            PathBuf::from("/base/security_logs/auth_log.txt")
        );

        config.storage.data_dir = Some(PathBuf::from("/elsewhere"));
        config.storage.audit_log = Some(PathBuf::from("/logs/audit.txt"));
        assert_eq!(dev.data_dir(&config), PathBuf::from("/elsewhere"));
        assert_eq!(dev.audit_log_path(&config), PathBuf::from("/logs/audit.txt"));
    }
}
