use ndarray::{Array3, ArrayView3};

use super::resample::{sample_linear, sample_nearest, Field};
use super::{Interpolation, RegistrationError};
use crate::{Affine, Grid, GridAttr, Idx3d, Point3, Volume};

/// 配准得到的空间变换: 将固定图像 (模板) 网格上的点映射到运动图像 (被试) 的物理空间.
///
/// 对固定网格体素 `p`, 先加上位移场 `u(p)` 得到 `x = A_f·p + u(p)`,
/// 再经仿射部分映射到运动物理坐标 `y = T·x`.
///
/// 一个 `Transform` 只属于一对 (运动, 固定) 图像, 创建后不再修改.
#[derive(Debug, Clone)]
pub struct Transform {
    affine: Affine,
    field: Option<Field>,
    fixed: Grid,
    moving: Grid,
    interpolation: Interpolation,
}

impl Transform {
    pub(crate) fn new(
        affine: Affine,
        field: Option<Field>,
        fixed: Grid,
        moving: Grid,
        interpolation: Interpolation,
    ) -> Self {
        debug_assert!(field.as_ref().map_or(true, |f| f[0].dim() == fixed.shape()));
        Self {
            affine,
            field,
            fixed,
            moving,
            interpolation,
        }
    }

    /// 仿射部分 (固定物理坐标 -> 运动物理坐标).
    #[inline]
    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    /// 是否带有非线性位移场.
    #[inline]
    pub fn has_field(&self) -> bool {
        self.field.is_some()
    }

    /// 固定网格体素 `pos` 处的位移 (mm). 纯仿射变换恒为零.
    pub fn displacement_at(&self, pos: Idx3d) -> [f64; 3] {
        match &self.field {
            Some(f) => [f[0][pos] as f64, f[1][pos] as f64, f[2][pos] as f64],
            None => [0.0; 3],
        }
    }

    /// 变换输出所在的网格.
    #[inline]
    pub fn fixed_grid(&self) -> &Grid {
        &self.fixed
    }

    /// 计算变换时运动图像所在的网格.
    #[inline]
    pub fn moving_grid(&self) -> &Grid {
        &self.moving
    }

    /// 计算变换时对强度图像使用的插值方式.
    #[inline]
    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    /// 将 `volume` 重采样到固定网格.
    ///
    /// `volume` 的形状必须与计算变换时的运动图像一致; 其自身仿射用于物理坐标到体素的换算.
    pub fn apply(&self, volume: &Volume, interpolation: Interpolation) -> Result<Volume, RegistrationError> {
        if volume.shape() != self.moving.shape() {
            return Err(RegistrationError::GridMismatch {
                expected: self.moving.shape(),
                found: volume.shape(),
            });
        }
        let to_voxel = volume
            .affine()
            .inverse()
            .ok_or_else(|| RegistrationError::DegenerateGeometry("input affine is singular".into()))?
            .then_after(&self.affine);

        let src = volume.data();
        let sample: fn(&ArrayView3<f32>, Point3) -> f32 = match interpolation {
            Interpolation::NearestNeighbor => sample_nearest,
            Interpolation::Linear => sample_linear,
        };
        let data = Array3::from_shape_fn(self.fixed.shape(), |p| {
            let [x, y, z] = self.fixed.to_physical(p);
            let [dx, dy, dz] = self.displacement_at(p);
            sample(&src, to_voxel.apply([x + dx, y + dy, z + dz]))
        });
        Ok(Volume::new(self.fixed, data)?)
    }
}
