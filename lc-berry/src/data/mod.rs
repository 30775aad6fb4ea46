use std::ops::Index;
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView3, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

use crate::{Idx3d, Point3};

mod affine;
mod mask;

pub use affine::Affine;
pub use mask::Mask;

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 体数据读写与构造错误.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// 文件不存在.
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// nifti 底层解析 / 写出错误.
    #[error("nifti error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// 维度数不是 3 或 4.
    #[error("unsupported volume shape {0:?}, expected 3-D or 4-D")]
    UnsupportedShape(Vec<usize>),

    /// 多回波数据的回波索引越界.
    #[error("echo {echo} out of range, file holds {len} echoes")]
    EchoOutOfRange {
        /// 请求的回波索引.
        echo: usize,
        /// 实际回波个数.
        len: usize,
    },

    /// 数据形状和网格形状不一致.
    #[error("data shape {found:?} does not match grid shape {expected:?}")]
    ShapeMismatch {
        /// 网格形状.
        expected: Idx3d,
        /// 数据形状.
        found: Idx3d,
    },
}

/// 体素网格: 体素个数 `(nx, ny, nz)` 加上体素索引到物理坐标 (mm) 的仿射映射.
///
/// 索引顺序与 nifti 文件一致, 即 `(i, j, k)`, 而非自然图像的 `(z, h, w)`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Grid {
    shape: Idx3d,
    affine: Affine,
}

impl Grid {
    /// 构造网格.
    #[inline]
    pub fn new(shape: Idx3d, affine: Affine) -> Self {
        Self { shape, affine }
    }

    /// 体素个数.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.shape
    }

    /// 体素索引 -> 物理坐标.
    #[inline]
    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    /// 两个网格是否一致: 形状相同且仿射矩阵在容差内相同.
    #[inline]
    pub fn same_as(&self, other: &Grid) -> bool {
        self.shape == other.shape && self.affine.approx_eq(&other.affine)
    }

    /// 体素 `pos` 中心的物理坐标.
    #[inline]
    pub fn to_physical(&self, (i, j, k): Idx3d) -> Point3 {
        self.affine.apply([i as f64, j as f64, k as f64])
    }
}

/// 带网格的 3D 数据共用属性和部分通用操作.
pub trait GridAttr {
    /// 获取网格.
    fn grid(&self) -> &Grid;

    /// 获取数据形状大小.
    #[inline]
    fn shape(&self) -> Idx3d {
        self.grid().shape()
    }

    /// 获取仿射矩阵.
    #[inline]
    fn affine(&self) -> &Affine {
        self.grid().affine()
    }

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        let (x, y, z) = self.shape();
        x * y * z
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (i0, j0, k0): &Idx3d) -> bool {
        let (i, j, k) = self.shape();
        *i0 < i && *j0 < j && *k0 < k
    }

    /// 获取单个体素三个轴向的分辨率, 以毫米为单位.
    #[inline]
    fn voxel_sizes(&self) -> [f64; 3] {
        self.affine().voxel_sizes()
    }

    /// 体素分辨率在三个维度上是否是各向同的?
    #[inline]
    fn is_isotropic(&self) -> bool {
        let [a, b, c] = self.voxel_sizes();
        (a - b).abs() < 1e-6 && (a - c).abs() < 1e-6
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel_volume(&self) -> f64 {
        self.affine().voxel_volume()
    }

    /// 与另一对象是否位于同一网格上.
    #[inline]
    fn same_grid<G: GridAttr + ?Sized>(&self, other: &G) -> bool {
        self.grid().same_as(other.grid())
    }

    /// 获取 `pos` 前后上下左右六个点的坐标.
    ///
    /// 在数据范围外的坐标会被过滤掉, 不会包含在返回值中.
    fn diamond_neighbours(&self, (i, j, k): Idx3d) -> Vec<Idx3d> {
        [
            (i.wrapping_sub(1), j, k),
            (i.saturating_add(1), j, k),
            (i, j.wrapping_sub(1), k),
            (i, j.saturating_add(1), k),
            (i, j, k.wrapping_sub(1)),
            (i, j, k.saturating_add(1)),
        ]
        .into_iter()
        .filter(|p| self.check(p))
        .collect()
    }
}

impl GridAttr for Grid {
    #[inline]
    fn grid(&self) -> &Grid {
        self
    }
}

/// nii 格式 3D 标量体数据, 包括 header、网格和强度值. 强度值以 `f32` 保存.
///
/// 实例一经构造便不再修改, 所有变换都产生新的 `Volume`.
#[derive(Debug, Clone)]
pub struct Volume {
    header: BoxedHeader,
    grid: Grid,
    data: Array3<f32>,
}

impl GridAttr for Volume {
    #[inline]
    fn grid(&self) -> &Grid {
        &self.grid
    }
}

impl Index<Idx3d> for Volume {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl Volume {
    /// 打开 nii / nii.gz 文件. 若为 4D 多回波数据, 取第一个回波.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VolumeError> {
        Self::open_echo(path, 0)
    }

    /// 打开 nii / nii.gz 文件, 并取第 `echo` 个回波 (3D 文件只接受 `echo == 0`).
    pub fn open_echo<P: AsRef<Path>>(path: P, echo: usize) -> Result<Self, VolumeError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VolumeError::NotFound(path.to_owned()));
        }
        let obj = ReaderOptions::new().read_file(path)?;
        let header = Box::new(obj.header().clone());
        let affine = Affine::from_header(&header);

        // nifti 数据按 [i, j, k(, echo)] 索引.
        let raw = obj.into_volume().into_ndarray::<f32>()?;
        let raw_shape = raw.shape().to_vec();
        let data = match raw.ndim() {
            3 => {
                if echo != 0 {
                    return Err(VolumeError::EchoOutOfRange { echo, len: 1 });
                }
                raw.into_dimensionality::<Ix3>()
                    .map_err(|_| VolumeError::UnsupportedShape(raw_shape.clone()))?
            }
            4 => {
                let raw = raw
                    .into_dimensionality::<Ix4>()
                    .map_err(|_| VolumeError::UnsupportedShape(raw_shape.clone()))?;
                let len = raw.len_of(Axis(3));
                if echo >= len {
                    return Err(VolumeError::EchoOutOfRange { echo, len });
                }
                raw.index_axis(Axis(3), echo).to_owned()
            }
            _ => return Err(VolumeError::UnsupportedShape(raw_shape)),
        };
        let data = data.as_standard_layout().into_owned();
        let grid = Grid::new(data.dim(), affine);
        log::debug!("Loaded {} with shape {:?}", path.display(), grid.shape());

        Ok(Self { header, grid, data })
    }

    /// 以 `grid` 为网格直接创建 `Volume`, header 由网格合成.
    pub fn new(grid: Grid, data: Array3<f32>) -> Result<Self, VolumeError> {
        if data.dim() != grid.shape() {
            return Err(VolumeError::ShapeMismatch {
                expected: grid.shape(),
                found: data.dim(),
            });
        }
        let mut header = Box::<NiftiHeader>::default();
        grid.affine().write_into_header(&mut header);
        Ok(Self { header, grid, data })
    }

    /// 复用 `self` 的网格和 header, 替换强度数据.
    pub fn with_data(&self, data: Array3<f32>) -> Result<Self, VolumeError> {
        if data.dim() != self.grid.shape() {
            return Err(VolumeError::ShapeMismatch {
                expected: self.grid.shape(),
                found: data.dim(),
            });
        }
        Ok(Self {
            header: self.header.clone(),
            grid: self.grid,
            data,
        })
    }

    /// 以 nii 格式写出 (扩展名为 `.gz` 时压缩).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), VolumeError> {
        let mut header = self.header.clone();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        self.grid.affine().write_into_header(&mut header);
        WriterOptions::new(path.as_ref())
            .reference_header(&header)
            .write_nifti(&self.data)?;
        Ok(())
    }

    /// 获取 header 部分.
    #[inline]
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// 消费自我, 获得底层数据.
    #[inline]
    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// 获取所有有限值体素的个数.
    #[inline]
    pub fn finite_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }

    /// 计算由 `it` 给出的所有索引对应的有限强度值的平均值.
    ///
    /// 非有限值被忽略. 如果没有任何有限值, 返回 `None`. 越界索引导致 panic.
    pub fn mean_over<I: IntoIterator<Item = Idx3d>>(&self, it: I) -> Option<f64> {
        let mut count = 0u64;
        let mut sum = 0.0;
        for v in it.into_iter().map(|pos| self[pos]).filter(|v| v.is_finite()) {
            count += 1;
            sum += v as f64;
        }
        (count != 0).then(|| sum / count as f64)
    }
}
