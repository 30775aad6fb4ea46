//! 流水线配置.
//!
//! [`PipelineConfig`] 在整个流程中只读, 以参数形式显式传入每个组件,
//! 而不是从全局状态读取. 这样配准和统计结果才可复现.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{contrast, NII_GZ, TEMPLATE_SPACE_TAG};
use crate::Point3;

/// 配置加载或校验错误.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 读取配置文件失败.
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        /// 配置文件路径.
        path: PathBuf,
        /// 底层错误.
        source: std::io::Error,
    },

    /// JSON 解析失败.
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    /// 字段取值非法.
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        /// 字段名.
        field: &'static str,
        /// 原因.
        reason: String,
    },
}

/// 某个对比度及其候选文件名后缀. 候选项按优先级排列.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContrastPattern {
    /// 对比度名, 如 `R1`, `QSM`.
    pub name: String,

    /// 候选文件名后缀, 如 `["R1map.nii.gz", "R1.nii.gz"]`.
    pub patterns: Vec<String>,
}

impl ContrastPattern {
    fn new(name: &str, patterns: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// 配准参数设置 (以名字给出算法和度量, 由
/// [`RegistrationParams::from_settings`](crate::registration::RegistrationParams::from_settings) 解析).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    /// 配准类型: `SyN`, `Affine` 或 `Translation`.
    pub registration_type: String,

    /// 相似性度量: `CC` 或 `MeanSquares`.
    pub syn_metric: String,

    /// `CC` 的邻域半径 (体素).
    pub syn_sampling: u32,

    /// 多分辨率迭代次数, 由粗到细.
    pub reg_iterations: Vec<u32>,

    /// 单次更新的最大位移 (以当前层体素为单位).
    pub gradient_step: f64,

    /// 更新场的高斯平滑 sigma (体素).
    pub flow_sigma: f64,

    /// 总位移场的高斯平滑 sigma (体素). `0` 表示不平滑.
    pub total_sigma: f64,

    /// 收敛判定阈值 (度量的相对变化量).
    pub convergence_threshold: f64,

    /// 收敛判定窗口 (迭代次数).
    pub convergence_window: u32,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            registration_type: "SyN".to_owned(),
            syn_metric: "CC".to_owned(),
            syn_sampling: 4,
            reg_iterations: vec![100, 70, 50, 20],
            gradient_step: 0.2,
            flow_sigma: 3.0,
            total_sigma: 0.0,
            convergence_threshold: 1e-6,
            convergence_window: 10,
        }
    }
}

/// 7T 蓝斑核定量流水线配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// BIDS 数据根目录.
    pub data_dir: PathBuf,

    /// 结果输出目录.
    pub output_dir: PathBuf,

    /// 图像输出目录 (由外部绘图工具使用).
    pub figures_dir: PathBuf,

    /// 图谱目录.
    pub atlas_dir: PathBuf,

    /// 蓝斑核概率图谱文件名.
    pub lc_atlas_filename: String,

    /// 参考区掩膜文件名.
    pub reference_roi_filename: String,

    /// 模板 (配准固定图像) 文件名.
    pub template_filename: String,

    /// 用户指定的参考区掩膜. 若给出但不存在, 视为错误.
    pub custom_reference_path: Option<PathBuf>,

    /// 图谱二值化阈值.
    pub lc_probability_threshold: f64,

    /// 几何参考区构造时, 图谱概率高于该值的体素被排除.
    pub exclusion_threshold: f64,

    /// 读入的参考区掩膜的二值化阈值.
    pub reference_threshold: f64,

    /// 几何参考区球心 (模板空间物理坐标, mm).
    pub reference_center_mni: Point3,

    /// 几何参考区半径 (mm).
    pub reference_radius_mm: f64,

    /// ROI 与参考区允许重叠的最大体素数.
    pub max_mask_overlap: usize,

    /// 配准参数.
    pub registration: RegistrationSettings,

    /// 主结构像对比度名. 配准以其为准.
    pub primary_contrast: String,

    /// 对比度 -> 候选文件名后缀. 有序.
    pub contrast_patterns: Vec<ContrastPattern>,

    /// 是否将配准后的各对比度写入输出目录.
    pub save_warped: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("outputs/results"),
            figures_dir: PathBuf::from("outputs/figures"),
            atlas_dir: PathBuf::from("atlases"),
            lc_atlas_filename: "LC_prob_MNI.nii.gz".to_owned(),
            reference_roi_filename: "pontine_reference_MNI.nii.gz".to_owned(),
            template_filename: "MNI152_T1_2009b.nii.gz".to_owned(),
            custom_reference_path: None,
            lc_probability_threshold: 0.5,
            exclusion_threshold: 0.1,
            reference_threshold: 0.0,
            reference_center_mni: [0.0, -30.0, -28.0],
            reference_radius_mm: 3.0,
            max_mask_overlap: 0,
            registration: RegistrationSettings::default(),
            primary_contrast: contrast::T1W.to_owned(),
            contrast_patterns: vec![
                ContrastPattern::new(contrast::T1W, &["T1w.nii.gz", "UNIT1.nii.gz"]),
                ContrastPattern::new(contrast::R1, &["R1map.nii.gz", "R1.nii.gz"]),
                ContrastPattern::new(contrast::R2STAR, &["R2starmap.nii.gz", "R2star.nii.gz"]),
                ContrastPattern::new(contrast::QSM, &["QSM.nii.gz", "Chimap.nii.gz"]),
                ContrastPattern::new(contrast::T2STARW, &["T2starw.nii.gz"]),
            ],
            save_warped: true,
        }
    }
}

impl PipelineConfig {
    /// 从 JSON 文件加载. 未给出的字段取默认值. 加载后立即校验.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// 从 JSON 字符串加载. 未给出的字段取默认值. 加载后立即校验.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if !(0.0..1.0).contains(&self.lc_probability_threshold) {
            return Err(invalid("lc_probability_threshold", "must lie in [0, 1)"));
        }
        if !(0.0..1.0).contains(&self.exclusion_threshold) {
            return Err(invalid("exclusion_threshold", "must lie in [0, 1)"));
        }
        if self.exclusion_threshold > self.lc_probability_threshold {
            return Err(invalid(
                "exclusion_threshold",
                "must not exceed lc_probability_threshold, or the reference may overlap the ROI",
            ));
        }
        if !(self.reference_radius_mm.is_finite() && self.reference_radius_mm > 0.0) {
            return Err(invalid("reference_radius_mm", "must be a positive number"));
        }
        if self.reference_center_mni.iter().any(|v| !v.is_finite()) {
            return Err(invalid("reference_center_mni", "must be finite"));
        }
        let reg = &self.registration;
        if reg.reg_iterations.is_empty() {
            return Err(invalid("registration.reg_iterations", "must not be empty"));
        }
        if !(reg.gradient_step.is_finite() && reg.gradient_step > 0.0) {
            return Err(invalid("registration.gradient_step", "must be positive"));
        }
        if reg.flow_sigma < 0.0 || reg.total_sigma < 0.0 {
            return Err(invalid("registration.flow_sigma", "sigmas must be >= 0"));
        }
        if self.patterns(&self.primary_contrast).is_none() {
            return Err(invalid(
                "primary_contrast",
                format!("`{}` has no entry in contrast_patterns", self.primary_contrast),
            ));
        }
        if let Some(p) = self.contrast_patterns.iter().find(|p| p.patterns.is_empty()) {
            return Err(invalid(
                "contrast_patterns",
                format!("`{}` lists no candidate suffix", p.name),
            ));
        }
        Ok(())
    }

    /// 蓝斑核图谱全路径.
    #[inline]
    pub fn lc_atlas_path(&self) -> PathBuf {
        self.atlas_dir.join(&self.lc_atlas_filename)
    }

    /// 参考区掩膜全路径.
    #[inline]
    pub fn reference_roi_path(&self) -> PathBuf {
        self.atlas_dir.join(&self.reference_roi_filename)
    }

    /// 模板全路径.
    #[inline]
    pub fn template_path(&self) -> PathBuf {
        self.atlas_dir.join(&self.template_filename)
    }

    /// 获取对比度 `name` 的候选后缀.
    pub fn patterns(&self, name: &str) -> Option<&[String]> {
        self.contrast_patterns
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.patterns.as_slice())
    }

    /// 除主结构像以外的对比度, 保持配置顺序.
    pub fn secondary_contrasts(&self) -> impl Iterator<Item = &ContrastPattern> {
        self.contrast_patterns
            .iter()
            .filter(move |p| p.name != self.primary_contrast)
    }

    /// 某被试的输出目录.
    #[inline]
    pub fn subject_output_dir(&self, subject_id: &str) -> PathBuf {
        self.output_dir.join(subject_id)
    }

    /// 某被试某对比度配准后文件的路径: `<out>/<sub>/<sub>_<contrast>_MNI.nii.gz`.
    pub fn warped_path(&self, subject_id: &str, contrast_name: &str) -> PathBuf {
        self.subject_output_dir(subject_id).join(format!(
            "{subject_id}_{contrast_name}_{TEMPLATE_SPACE_TAG}.{NII_GZ}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, PipelineConfig};
    use std::path::PathBuf;

    #[test]
    fn test_default_is_valid() {
        let c = PipelineConfig::default();
        c.validate().unwrap();
        assert_eq!(c.lc_atlas_path(), PathBuf::from("atlases/LC_prob_MNI.nii.gz"));
        assert_eq!(c.registration.reg_iterations, vec![100, 70, 50, 20]);
        assert_eq!(
            c.patterns("R2star").unwrap(),
            &["R2starmap.nii.gz".to_owned(), "R2star.nii.gz".to_owned()]
        );
        let names: Vec<_> = c.secondary_contrasts().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["R1", "R2star", "QSM", "T2starw"]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let c = PipelineConfig::from_json_str(
            r#"{ "lc_probability_threshold": 0.3, "data_dir": "/srv/bids" }"#,
        )
        .unwrap();
        assert_eq!(c.lc_probability_threshold, 0.3);
        assert_eq!(c.data_dir, PathBuf::from("/srv/bids"));
        assert_eq!(c.reference_radius_mm, 3.0);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let e = PipelineConfig::from_json_str(r#"{ "exclusion_threshold": 0.8 }"#).unwrap_err();
        assert!(matches!(
            e,
            ConfigError::Invalid {
                field: "exclusion_threshold",
                ..
            }
        ));
    }

    #[test]
    fn test_warped_path() {
        let c = PipelineConfig::default();
        assert_eq!(
            c.warped_path("sub-01", "QSM"),
            PathBuf::from("outputs/results/sub-01/sub-01_QSM_MNI.nii.gz")
        );
        // 不带 `sub-` 前缀的编号照样拼接.
        assert_eq!(
            c.warped_path("pilot3", "R1"),
            PathBuf::from("outputs/results/pilot3/pilot3_R1_MNI.nii.gz")
        );
    }
}
