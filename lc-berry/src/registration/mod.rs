//! 被试空间到模板空间的配准.
//!
//! 配准算法以 [`RegistrationBackend`] trait 的形式提供, 下游掩膜与统计代码只依赖
//! [`Transform`], 不关心它由哪个后端算出. 内置的 [`NativeBackend`] 实现:
//!
//! 1. 网格与前景校验;
//! 2. 基于强度矩的初始对齐 (质心平移, 以及逐轴尺度);
//! 3. (`SyN`) 多分辨率对称力 demons, 估计定义在模板网格上的位移场.
//!
//! 所有步骤均为确定性的串行计算, 相同输入总是得到相同输出.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::config::RegistrationSettings;
use crate::{GridAttr, Idx3d, Volume, VolumeError};

mod metric;
mod moments;
mod resample;
mod subject;
mod syn;
mod transform;

pub use subject::{load_registered_subject, register_subject, RegisteredSubject};
pub use transform::Transform;

/// 配准相关错误.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// 找不到主结构像, 无法配准.
    #[error("[{subject_id}] missing primary contrast `{contrast}`")]
    MissingInput {
        /// 被试编号.
        subject_id: String,
        /// 缺失的对比度.
        contrast: String,
    },

    /// 输入几何退化: 空网格, 奇异仿射, 或前景为空 / 包围盒体积为零.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// 迭代过程中度量非有限, 或结果劣于初始状态.
    #[error("registration did not converge: {0}")]
    NotConverged(String),

    /// 待变换体数据的网格与计算变换时的运动图像不一致.
    #[error("volume shape {found:?} does not match the moving grid {expected:?}")]
    GridMismatch {
        /// 运动图像网格形状.
        expected: Idx3d,
        /// 输入形状.
        found: Idx3d,
    },

    /// 不认识的算法或度量名称.
    #[error("unknown registration parameter: {0}")]
    UnknownParameter(String),

    /// 参数取值非法.
    #[error("invalid registration parameter: {0}")]
    InvalidParameter(String),

    /// 读写体数据失败.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    /// 创建输出目录失败.
    #[error("cannot create {}: {source}", path.display())]
    Io {
        /// 目录.
        path: PathBuf,
        /// 底层错误.
        source: std::io::Error,
    },
}

/// 配准类型.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    /// 仅平移.
    Translation,

    /// 平移与逐轴缩放.
    Affine,

    /// 仿射初始化后估计非线性位移场.
    SyN,
}

impl FromStr for RegistrationKind {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Translation" => Ok(Self::Translation),
            "Affine" => Ok(Self::Affine),
            "SyN" => Ok(Self::SyN),
            _ => Err(RegistrationError::UnknownParameter(format!(
                "registration type `{s}`"
            ))),
        }
    }
}

/// 相似性度量.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// 局部互相关. 对不同对比度间的线性强度差异不敏感.
    CC,

    /// 均方差.
    MeanSquares,
}

impl FromStr for Metric {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CC" => Ok(Self::CC),
            "MeanSquares" => Ok(Self::MeanSquares),
            _ => Err(RegistrationError::UnknownParameter(format!("metric `{s}`"))),
        }
    }
}

/// 重采样插值方式. 标签 / 掩膜须用最近邻, 连续强度图用线性插值.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// 最近邻. 输出值均来自输入.
    NearestNeighbor,

    /// 三线性插值.
    Linear,
}

/// 配准参数. 没有默认值: 调用处必须显式给出每一项, 或从配置解析.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationParams {
    /// 配准类型.
    pub kind: RegistrationKind,

    /// 相似性度量.
    pub metric: Metric,

    /// `CC` 的邻域半径 (体素).
    pub sampling: u32,

    /// 由粗到细各层的迭代次数. 层数即金字塔层数.
    pub iterations: Vec<u32>,

    /// 单次更新的最大位移, 以当前层体素为单位.
    pub gradient_step: f64,

    /// 更新场的高斯平滑 sigma (体素).
    pub flow_sigma: f64,

    /// 总位移场的高斯平滑 sigma (体素).
    pub total_sigma: f64,

    /// 收敛阈值.
    pub convergence_threshold: f64,

    /// 收敛窗口.
    pub convergence_window: u32,
}

impl RegistrationParams {
    /// 从配置解析. 名称无法识别时返回 [`RegistrationError::UnknownParameter`].
    pub fn from_settings(s: &RegistrationSettings) -> Result<Self, RegistrationError> {
        let params = Self {
            kind: s.registration_type.parse()?,
            metric: s.syn_metric.parse()?,
            sampling: s.syn_sampling,
            iterations: s.reg_iterations.clone(),
            gradient_step: s.gradient_step,
            flow_sigma: s.flow_sigma,
            total_sigma: s.total_sigma,
            convergence_threshold: s.convergence_threshold,
            convergence_window: s.convergence_window,
        };
        params.validate()?;
        Ok(params)
    }

    /// 检查参数取值.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        let invalid = |s: &str| Err(RegistrationError::InvalidParameter(s.to_owned()));
        if self.iterations.is_empty() {
            return invalid("empty iteration schedule");
        }
        if self.iterations.len() > 8 {
            return invalid("more than 8 pyramid levels");
        }
        if !(self.gradient_step.is_finite() && self.gradient_step > 0.0) {
            return invalid("gradient_step must be positive");
        }
        if !(self.flow_sigma >= 0.0 && self.total_sigma >= 0.0) {
            return invalid("smoothing sigmas must be >= 0");
        }
        if !(self.convergence_threshold >= 0.0) {
            return invalid("convergence_threshold must be >= 0");
        }
        Ok(())
    }
}

/// 配准后端.
pub trait RegistrationBackend: Sync {
    /// 后端名称, 用于日志.
    fn name(&self) -> &str;

    /// 计算将 `moving` 对齐到 `fixed` 的变换.
    fn register(
        &self,
        moving: &Volume,
        fixed: &Volume,
        params: &RegistrationParams,
    ) -> Result<Transform, RegistrationError>;
}

/// 纯 Rust 实现的配准后端.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

/// 非有限值置零, 再按最大值归一化到 `[0, 1]`.
fn normalized(volume: &Volume) -> syn::Image {
    let data = volume
        .data()
        .mapv(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
    let max = data.iter().copied().fold(0.0f32, f32::max);
    let data = if max > 0.0 { data / max } else { data };
    syn::Image {
        data,
        grid: *volume.grid(),
    }
}

impl RegistrationBackend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn register(
        &self,
        moving: &Volume,
        fixed: &Volume,
        params: &RegistrationParams,
    ) -> Result<Transform, RegistrationError> {
        params.validate()?;
        moments::check_grid(fixed.grid(), "fixed")?;
        moments::check_grid(moving.grid(), "moving")?;

        let f = normalized(fixed);
        let m = normalized(moving);
        let fm = moments::moments(&f.data.view(), &f.grid, "fixed")?;
        let mm = moments::moments(&m.data.view(), &m.grid, "moving")?;
        let init = moments::initial_affine(&fm, &mm, params.kind);
        log::debug!(
            "moment init: centroid {:?} -> {:?}",
            fm.centroid,
            mm.centroid
        );

        let field = match params.kind {
            RegistrationKind::Translation | RegistrationKind::Affine => None,
            RegistrationKind::SyN => {
                let (field, initial, last) = syn::estimate_field(&f, &m, &init, params)?;
                log::debug!("{:?} energy {initial:.6} -> {last:.6}", params.metric);
                Some(field)
            }
        };
        Ok(Transform::new(
            init,
            field,
            *fixed.grid(),
            *moving.grid(),
            Interpolation::Linear,
        ))
    }
}

/// 使用内置后端将 `moving` 配准到 `fixed`.
pub fn register_to_template(
    moving: &Volume,
    fixed: &Volume,
    params: &RegistrationParams,
) -> Result<Transform, RegistrationError> {
    NativeBackend.register(moving, fixed, params)
}

/// 将 `transform` 作用于 `volume`, 输出位于模板网格上. 插值方式必须显式给出.
#[inline]
pub fn apply_transform(
    transform: &Transform,
    volume: &Volume,
    interpolation: Interpolation,
) -> Result<Volume, RegistrationError> {
    transform.apply(volume, interpolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Affine, Grid};
    use ndarray::Array3;

    const N: usize = 20;

    fn grid() -> Grid {
        Grid::new((N, N, N), Affine::axis_aligned([1.0; 3], [-10.0, -10.0, -10.0]))
    }

    /// 一个位于 `(c, c+1, c+2)` 附近的长方体, 强度沿 `i` 递增.
    fn cuboid(offset: (usize, usize, usize)) -> Volume {
        let (a, b, c) = offset;
        let data = Array3::from_shape_fn((N, N, N), |(i, j, k)| {
            let inside = (a..a + 6).contains(&i) && (b..b + 5).contains(&j) && (c..c + 4).contains(&k);
            if inside {
                1.0 + (i - a) as f32
            } else {
                0.0
            }
        });
        Volume::new(grid(), data).unwrap()
    }

    fn params(kind: RegistrationKind) -> RegistrationParams {
        RegistrationParams {
            kind,
            metric: Metric::MeanSquares,
            sampling: 2,
            iterations: vec![5, 5],
            gradient_step: 0.2,
            flow_sigma: 1.0,
            total_sigma: 0.0,
            convergence_threshold: 1e-6,
            convergence_window: 5,
        }
    }

    #[test]
    fn test_translation_recovered() {
        let fixed = cuboid((5, 6, 7));
        let moving = cuboid((8, 4, 8));
        let t = register_to_template(&moving, &fixed, &params(RegistrationKind::Translation)).unwrap();
        assert!(!t.has_field());

        let p = t.affine().apply([0.0, 0.0, 0.0]);
        let expected = [3.0, -2.0, 1.0];
        for a in 0..3 {
            assert!((p[a] - expected[a]).abs() < 1e-6, "{p:?}");
        }

        let warped = apply_transform(&t, &moving, Interpolation::Linear).unwrap();
        assert!(warped.same_grid(&fixed));
        let diff = warped
            .data()
            .iter()
            .zip(fixed.data().iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(diff < 1e-4, "max diff {diff}");
    }

    #[test]
    fn test_nearest_keeps_labels_binary() {
        let fixed = cuboid((5, 6, 7));
        let moving = cuboid((7, 7, 6));
        let t = register_to_template(&moving, &fixed, &params(RegistrationKind::Affine)).unwrap();

        let label = moving.with_data(moving.data().mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })).unwrap();
        let warped = apply_transform(&t, &label, Interpolation::NearestNeighbor).unwrap();
        assert!(warped.data().iter().all(|v| *v == 0.0 || *v == 1.0));
        assert!(warped.data().iter().any(|v| *v == 1.0));
    }

    #[test]
    fn test_syn_produces_field() {
        let fixed = cuboid((5, 6, 7));
        let moving = cuboid((6, 6, 7));
        let t = register_to_template(&moving, &fixed, &params(RegistrationKind::SyN)).unwrap();
        assert!(t.has_field());
        assert_eq!(t.fixed_grid(), fixed.grid());
        assert_eq!(t.interpolation(), Interpolation::Linear);
    }

    #[test]
    fn test_degenerate_inputs() {
        let fixed = cuboid((5, 6, 7));
        let empty = Volume::new(grid(), Array3::zeros((N, N, N))).unwrap();
        let e = register_to_template(&empty, &fixed, &params(RegistrationKind::Affine)).unwrap_err();
        assert!(matches!(e, RegistrationError::DegenerateGeometry(_)));

        let flat = Grid::new((N, N, N), Affine::axis_aligned([1.0, 1.0, 0.0], [0.0; 3]));
        let singular = Volume::new(flat, fixed.data().to_owned()).unwrap();
        let e = register_to_template(&singular, &fixed, &params(RegistrationKind::Affine)).unwrap_err();
        assert!(matches!(e, RegistrationError::DegenerateGeometry(_)));
    }

    #[test]
    fn test_apply_rejects_other_grid() {
        let fixed = cuboid((5, 6, 7));
        let t = register_to_template(&fixed, &fixed, &params(RegistrationKind::Translation)).unwrap();
        let other = Volume::new(
            Grid::new((N, N, N + 1), *grid().affine()),
            Array3::zeros((N, N, N + 1)),
        )
        .unwrap();
        assert!(matches!(
            apply_transform(&t, &other, Interpolation::Linear),
            Err(RegistrationError::GridMismatch { .. })
        ));
    }

    #[test]
    fn test_params_from_settings() {
        let mut s = RegistrationSettings::default();
        let p = RegistrationParams::from_settings(&s).unwrap();
        assert_eq!(p.kind, RegistrationKind::SyN);
        assert_eq!(p.metric, Metric::CC);
        assert_eq!(p.iterations, vec![100, 70, 50, 20]);

        s.syn_metric = "MI".to_owned();
        assert!(matches!(
            RegistrationParams::from_settings(&s),
            Err(RegistrationError::UnknownParameter(_))
        ));

        s.syn_metric = "CC".to_owned();
        s.reg_iterations.clear();
        assert!(matches!(
            RegistrationParams::from_settings(&s),
            Err(RegistrationError::InvalidParameter(_))
        ));
    }
}
