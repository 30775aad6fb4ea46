//! 对 `lc-berry::config` 的更一层封装. 从环境变量解析配置与数据目录.

use std::env;
use std::path::{Path, PathBuf};

use lc_berry::{ConfigError, PipelineConfig};

/// 配置文件路径环境变量.
pub const CONFIG_ENV: &str = "LC_CONFIG";

/// 数据目录环境变量.
pub const DATA_DIR_ENV: &str = "LC_DATA_DIR";

/// 获取配置文件路径: 若环境变量 `$LC_CONFIG` 非空, 返回其值.
pub fn config_path_from_env() -> Option<PathBuf> {
    env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// 获取 BIDS 数据基本路径.
///
/// 1. 若环境变量 `$LC_DATA_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/lc7t` (无法确定主目录时返回 `None`).
pub fn data_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        Some(d) => Some(PathBuf::from(d)),
        None => lc_berry::dataset::home_dataset_dir_with(["lc7t"]),
    }
}

/// 加载配置.
///
/// 1. `path` 给出时从该文件读取; 否则尝试 `$LC_CONFIG`; 都没有则使用默认配置;
/// 2. 若配置文件未显式给出 `data_dir` 且 `$LC_DATA_DIR` 非空, 以后者覆盖.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let file = path.map(Path::to_path_buf).or_else(config_path_from_env);
    let mut config = match file.as_deref() {
        Some(p) => PipelineConfig::from_json_file(p)?,
        None => PipelineConfig::default(),
    };

    if config.data_dir == PipelineConfig::default().data_dir {
        if let Some(dir) = data_dir_from_env_or_home().filter(|d| d.is_dir()) {
            config.data_dir = dir;
        }
    }
    config.validate()?;
    Ok(config)
}
