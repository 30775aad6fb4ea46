//! BIDS 数据集操作: 被试枚举与对比度文件定位.
//!
//! 目录结构约定为 `data_dir/sub-<id>/ses-<id>/anat/sub-<id>_ses-<id>_..._<suffix>.nii.gz`.
//! 其中 `<suffix>` 与配置中每个对比度的候选后缀依次匹配.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use thiserror::Error;

use crate::consts::SUBJECT_PREFIX;
use crate::PipelineConfig;

mod subject;

pub use subject::SubjectRecord;

/// 数据集枚举错误.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// 期望的目录不存在.
    #[error("directory not found: {}", .0.display())]
    NotFound(PathBuf),

    /// 其他底层 I/O 错误.
    #[error("cannot scan {}: {source}", path.display())]
    Io {
        /// 出错的目录.
        path: PathBuf,
        /// 底层错误.
        source: io::Error,
    },
}

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}

/// 列出 `dir` 下所有名字以 `sub-` 开头的子目录名, 按字典序排列.
fn subject_dirs_in(dir: &Path) -> Result<Vec<String>, DiscoveryError> {
    let io_err = |source| DiscoveryError::Io {
        path: dir.to_owned(),
        source,
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(SUBJECT_PREFIX) {
                names.push(name.to_owned());
            }
        }
    }
    Ok(names.into_iter().sorted().collect())
}

/// 枚举 `data_dir` 下的被试编号 (形如 `sub-01`), 按字典序排列.
///
/// 目录不存在时返回 [`DiscoveryError::NotFound`]. 目录存在但没有被试时返回空 `Vec`,
/// 空队列是否致命由调用者决定.
pub fn list_subjects<P: AsRef<Path>>(data_dir: P) -> Result<Vec<String>, DiscoveryError> {
    let dir = data_dir.as_ref();
    if !dir.is_dir() {
        return Err(DiscoveryError::NotFound(dir.to_owned()));
    }
    subject_dirs_in(dir)
}

/// 枚举 `output_dir` 下已有输出目录的被试编号, 按字典序排列.
///
/// 与 [`list_subjects`] 不同, 输出目录不存在时返回空 `Vec`.
pub fn list_processed_subjects<P: AsRef<Path>>(output_dir: P) -> Result<Vec<String>, DiscoveryError> {
    let dir = output_dir.as_ref();
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    subject_dirs_in(dir)
}

/// 递归收集 `dir` 下的所有文件. 每层目录内按文件名排序, 以保证结果稳定.
fn walk_sorted(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk_sorted(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// 在被试目录 `data_dir/subject_id` 下递归查找对比度文件.
///
/// 按 `patterns` 给出的优先级依次尝试: 返回第一个文件名以该后缀结尾的文件.
/// 若同一后缀匹配多个文件, 取路径字典序最小者. 都不匹配 (或被试目录不存在)
/// 时返回 `None`, 不做任何猜测.
pub fn find_contrast_file<P, S>(data_dir: P, subject_id: &str, patterns: &[S]) -> Option<PathBuf>
where
    P: AsRef<Path>,
    S: AsRef<str>,
{
    let sub_dir = data_dir.as_ref().join(subject_id);
    if !sub_dir.is_dir() {
        return None;
    }
    let mut files = Vec::with_capacity(16);
    if let Err(e) = walk_sorted(&sub_dir, &mut files) {
        log::warn!("[{subject_id}] cannot scan {}: {e}", sub_dir.display());
        return None;
    }

    patterns.iter().find_map(|pattern| {
        let pattern = pattern.as_ref();
        files
            .iter()
            .find(|f| {
                f.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(pattern))
            })
            .cloned()
    })
}

/// 按配置一次性解析某被试所有对比度的文件路径.
pub fn discover_subject<P: AsRef<Path>>(
    data_dir: P,
    subject_id: &str,
    config: &PipelineConfig,
) -> SubjectRecord {
    let data_dir = data_dir.as_ref();
    let mut record = SubjectRecord::new(subject_id);
    for c in config.contrast_patterns.iter() {
        if let Some(path) = find_contrast_file(data_dir, subject_id, &c.patterns) {
            record.insert(&c.name, path);
        }
    }
    record
}
