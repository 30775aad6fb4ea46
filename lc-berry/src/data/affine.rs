//! 体素索引与物理坐标 (毫米) 之间的仿射映射.

use nalgebra::{Matrix3, Matrix4, Vector4};
use nifti::NiftiHeader;

use crate::Point3;

/// 4x4 仿射矩阵. 该对象是只读的, 所有变换均返回新的实例.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Affine(Matrix4<f64>);

impl Affine {
    /// 判断两个仿射矩阵是否相同时使用的逐元素容差.
    pub const TOLERANCE: f64 = 1e-4;

    /// 单位矩阵, 即 1 mm 各向同性、原点在 `(0, 0, 0)` 体素中心.
    #[inline]
    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    /// 由行优先的 16 个元素构造.
    #[inline]
    pub fn from_row_slice(m: &[f64; 16]) -> Self {
        Self(Matrix4::from_row_slice(m))
    }

    /// 直接包装一个 `nalgebra` 矩阵. 调用者保证最后一行为 `[0, 0, 0, 1]`.
    #[inline]
    pub fn from_matrix(m: Matrix4<f64>) -> Self {
        Self(m)
    }

    /// 轴对齐网格: 体素尺寸为 `spacing` (mm), `(0, 0, 0)` 体素中心位于物理坐标 `origin`.
    pub fn axis_aligned(spacing: [f64; 3], origin: Point3) -> Self {
        let [sx, sy, sz] = spacing;
        let [ox, oy, oz] = origin;
        Self::from_row_slice(&[
            sx, 0.0, 0.0, ox, //
            0.0, sy, 0.0, oy, //
            0.0, 0.0, sz, oz, //
            0.0, 0.0, 0.0, 1.0,
        ])
    }

    /// 从 nifti header 中读取仿射矩阵.
    ///
    /// 优先级: `sform` (若 `sform_code > 0`) > `qform` (若 `qform_code > 0`) > 仅按 `pixdim` 缩放.
    pub fn from_header(h: &NiftiHeader) -> Self {
        if h.sform_code > 0 {
            let (x, y, z) = (&h.srow_x, &h.srow_y, &h.srow_z);
            Self::from_row_slice(&[
                x[0] as f64, x[1] as f64, x[2] as f64, x[3] as f64, //
                y[0] as f64, y[1] as f64, y[2] as f64, y[3] as f64, //
                z[0] as f64, z[1] as f64, z[2] as f64, z[3] as f64, //
                0.0, 0.0, 0.0, 1.0,
            ])
        } else if h.qform_code > 0 {
            Self::from_qform(h)
        } else {
            let [_, px, py, pz, ..] = h.pixdim;
            Self::axis_aligned([px.abs() as f64, py.abs() as f64, pz.abs() as f64], [0.0; 3])
        }
    }

    /// NIfTI-1 四元数形式 (method 2).
    fn from_qform(h: &NiftiHeader) -> Self {
        let (b, c, d) = (h.quatern_b as f64, h.quatern_c as f64, h.quatern_d as f64);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let [qfac, px, py, pz, ..] = h.pixdim;
        let qfac = if qfac < 0.0 { -1.0 } else { 1.0 };
        let (dx, dy, dz) = (px as f64, py as f64, pz as f64 * qfac);

        let r = Matrix3::new(
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - c * c - b * b,
        );
        let scaled = r * Matrix3::from_diagonal(&nalgebra::Vector3::new(dx, dy, dz));
        let mut m = scaled.to_homogeneous();
        m[(0, 3)] = h.quatern_x as f64;
        m[(1, 3)] = h.quatern_y as f64;
        m[(2, 3)] = h.quatern_z as f64;
        Self(m)
    }

    /// 将仿射矩阵写入 `header` 的 `sform` 与 `pixdim` 字段. `qform` 被关闭.
    pub fn write_into_header(&self, h: &mut NiftiHeader) {
        let m = &self.0;
        for (row, dst) in [&mut h.srow_x, &mut h.srow_y, &mut h.srow_z]
            .into_iter()
            .enumerate()
        {
            for col in 0..4 {
                dst[col] = m[(row, col)] as f32;
            }
        }
        let [vx, vy, vz] = self.voxel_sizes();
        h.pixdim[1] = vx as f32;
        h.pixdim[2] = vy as f32;
        h.pixdim[3] = vz as f32;
        h.sform_code = 2;
        h.qform_code = 0;
    }

    /// 底层矩阵.
    #[inline]
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    /// 左上角 3x3 线性部分.
    #[inline]
    pub fn linear(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// 逆矩阵. 若线性部分奇异或存在非有限值则返回 `None`.
    pub fn inverse(&self) -> Option<Self> {
        if self.0.iter().any(|v| !v.is_finite()) {
            return None;
        }
        if self.linear().determinant().abs() < 1e-12 {
            return None;
        }
        self.0.try_inverse().map(Self)
    }

    /// 复合映射 `self ∘ rhs`, 即先应用 `rhs` 再应用 `self`.
    #[inline]
    pub fn then_after(&self, rhs: &Affine) -> Self {
        Self(self.0 * rhs.0)
    }

    /// 将点 `p` 映射到目标坐标系.
    #[inline]
    pub fn apply(&self, [x, y, z]: Point3) -> Point3 {
        let v = self.0 * Vector4::new(x, y, z, 1.0);
        [v[0], v[1], v[2]]
    }

    /// 仅应用线性部分 (用于方向向量).
    #[inline]
    pub fn apply_linear(&self, [x, y, z]: Point3) -> Point3 {
        let v = self.0 * Vector4::new(x, y, z, 0.0);
        [v[0], v[1], v[2]]
    }

    /// 三个体素轴的物理长度 (列向量的模), 以毫米为单位.
    pub fn voxel_sizes(&self) -> [f64; 3] {
        let lin = self.linear();
        [
            lin.column(0).norm(),
            lin.column(1).norm(),
            lin.column(2).norm(),
        ]
    }

    /// 单个体素的物理体积, 以立方毫米为单位.
    #[inline]
    pub fn voxel_volume(&self) -> f64 {
        self.linear().determinant().abs()
    }

    /// 逐元素比较, 容差为 [`Self::TOLERANCE`].
    pub fn approx_eq(&self, other: &Affine) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| (a - b).abs() <= Self::TOLERANCE)
    }
}

impl Default for Affine {
    #[inline]
    fn default() -> Self {
        Self::identity()
    }
}
