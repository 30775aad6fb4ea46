use std::path::Path;

use serde::{Deserialize, Serialize};

use super::CnrStats;

/// 结果表中的一行: 某被试某对比度的定量结果. 只追加, 不修改.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    /// 被试编号.
    pub subject_id: String,
    /// 对比度名.
    pub contrast_name: String,
    /// ROI 均值.
    pub mean_roi: f64,
    /// 参考区均值.
    pub mean_ref: f64,
    /// 参考区标准差.
    pub std_ref: f64,
    /// 对比度噪声比.
    pub cnr: f64,
    /// 对比度比.
    pub cr: f64,
}

impl ExtractionRecord {
    /// 由统计结果构造.
    pub fn new(subject_id: &str, contrast_name: &str, stats: &CnrStats) -> Self {
        Self {
            subject_id: subject_id.to_owned(),
            contrast_name: contrast_name.to_owned(),
            mean_roi: stats.mean_roi,
            mean_ref: stats.mean_ref,
            std_ref: stats.std_ref,
            cnr: stats.cnr,
            cr: stats.cr,
        }
    }
}

/// 按 (被试, 对比度) 排序.
pub fn sort_records(records: &mut [ExtractionRecord]) {
    records.sort_by(|a, b| {
        a.subject_id
            .cmp(&b.subject_id)
            .then_with(|| a.contrast_name.cmp(&b.contrast_name))
    });
}

/// 以 CSV 格式写出, 首行为字段名.
pub fn write_records<P: AsRef<Path>>(path: P, records: &[ExtractionRecord]) -> csv::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    if records.is_empty() {
        writer.write_record([
            "subject_id",
            "contrast_name",
            "mean_roi",
            "mean_ref",
            "std_ref",
            "cnr",
            "cr",
        ])?;
    }
    for r in records {
        writer.serialize(r)?;
    }
    writer.flush()?;
    Ok(())
}
