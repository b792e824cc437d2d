// src/infra/paths.rs — XDG-compliant path management
//
// All paths respect the AGENTFORGE_HOME environment variable for isolation.
// When AGENTFORGE_HOME is set, config, data and workspaces live under it.

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "agentforge")
}

fn forge_home() -> Option<PathBuf> {
    std::env::var_os("AGENTFORGE_HOME").map(PathBuf::from)
}

/// Configuration directory: $AGENTFORGE_HOME/ or XDG_CONFIG_HOME/agentforge
pub fn config_dir() -> PathBuf {
    if let Some(home) = forge_home() {
        return home;
    }
    project_dirs()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".agentforge"))
}

/// Data directory: $AGENTFORGE_HOME/data/ or XDG_DATA_HOME/agentforge
pub fn data_dir() -> PathBuf {
    if let Some(home) = forge_home() {
        return home.join("data");
    }
    project_dirs()
        .map(|d| d.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".agentforge").join("data"))
}

pub fn db_path() -> PathBuf {
    data_dir().join("agentforge.db")
}

/// Root under which per-run workspaces are created.
pub fn workspaces_dir() -> PathBuf {
    data_dir().join("workspaces")
}

pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub async fn ensure_dirs() -> anyhow::Result<()> {
    for dir in [config_dir(), data_dir(), workspaces_dir()] {
        tokio::fs::create_dir_all(&dir).await?;
    }
    Ok(())
}
