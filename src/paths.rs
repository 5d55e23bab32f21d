use anyhow::Context;
use std::env;
use std::path::{Path, PathBuf};

fn home_dir() -> anyhow::Result<PathBuf> {
    let home = env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home))
}

fn ensure_dir(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// `$LLM_BRIDGE_HOME/config`, `$XDG_CONFIG_HOME/llm-bridge` or `~/.config/llm-bridge`.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = env::var_os("LLM_BRIDGE_HOME").map(PathBuf::from) {
        return ensure_dir(&base.join("config"));
    }

    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join("llm-bridge"));
    }

    ensure_dir(&home_dir()?.join(".config").join("llm-bridge"))
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}
