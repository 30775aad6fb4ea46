use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// 某被试各对比度原始文件的路径.
///
/// 缺失的对比度不出现在表中. 键按对比度名排序, 遍历顺序稳定.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    subject_id: String,
    files: BTreeMap<String, PathBuf>,
}

impl SubjectRecord {
    /// 创建空记录.
    pub fn new(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_owned(),
            files: BTreeMap::new(),
        }
    }

    /// 被试编号.
    #[inline]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// 记录某对比度的文件路径, 覆盖已有值.
    pub fn insert<P: Into<PathBuf>>(&mut self, contrast: &str, path: P) {
        self.files.insert(contrast.to_owned(), path.into());
    }

    /// 获取某对比度的文件路径.
    #[inline]
    pub fn get(&self, contrast: &str) -> Option<&Path> {
        self.files.get(contrast).map(PathBuf::as_path)
    }

    /// 已找到的对比度个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// 是否一个对比度都没有找到.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 按对比度名遍历.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }
}
