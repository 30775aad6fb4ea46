use std::ops::Index;

use ndarray::{Array3, ArrayView3, Zip};

use super::{Grid, GridAttr, Volume, VolumeError};
use crate::Idx3d;

/// 二值体素掩膜. 与某个参考体数据共享网格.
///
/// 概率掩膜以 [`Volume`] 表示, 经 [`Mask::threshold`] 二值化后得到该结构.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    grid: Grid,
    data: Array3<bool>,
}

impl GridAttr for Mask {
    #[inline]
    fn grid(&self) -> &Grid {
        &self.grid
    }
}

impl Index<Idx3d> for Mask {
    type Output = bool;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl Mask {
    /// 直接创建掩膜. 若 `data` 形状与 `grid` 不一致, 返回 `Err`.
    pub fn new(grid: Grid, data: Array3<bool>) -> Result<Self, VolumeError> {
        if data.dim() != grid.shape() {
            return Err(VolumeError::ShapeMismatch {
                expected: grid.shape(),
                found: data.dim(),
            });
        }
        Ok(Self { grid, data })
    }

    /// 在 `grid` 上创建全空掩膜.
    #[inline]
    pub fn empty(grid: Grid) -> Self {
        let data = Array3::from_elem(grid.shape(), false);
        Self { grid, data }
    }

    /// 在 `grid` 上创建只包含 `positions` 的掩膜. 越界索引导致 panic.
    pub fn from_positions<I: IntoIterator<Item = Idx3d>>(grid: Grid, positions: I) -> Self {
        let mut ans = Self::empty(grid);
        positions.into_iter().for_each(|p| ans.data[p] = true);
        ans
    }

    /// 将 (概率) 体数据二值化: 值严格大于 `threshold` 且有限的体素被选中.
    pub fn threshold(volume: &Volume, threshold: f64) -> Self {
        let data = volume
            .data()
            .mapv(|v| v.is_finite() && (v as f64) > threshold);
        Self {
            grid: *volume.grid(),
            data,
        }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, bool> {
        self.data.view()
    }

    /// 被选中的体素个数.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|p| **p).count()
    }

    /// 是否没有任何体素被选中.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|p| *p)
    }

    /// 收集所有被选中体素的下标, 结果按行优先存储.
    pub fn positions(&self) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, p)| p.then_some(pos))
            .collect()
    }

    /// 两个掩膜同时选中的体素个数. 调用者保证两者位于同一网格, 否则程序 panic.
    pub fn overlap_count(&self, other: &Mask) -> usize {
        assert_eq!(self.shape(), other.shape(), "掩膜形状不一致");
        Zip::from(&self.data)
            .and(&other.data)
            .fold(0usize, |acc, a, b| acc + usize::from(*a && *b))
    }

    /// 两个掩膜是否不相交.
    #[inline]
    pub fn is_disjoint(&self, other: &Mask) -> bool {
        self.overlap_count(other) == 0
    }

    /// 从 `self` 中移除 `other` 选中的体素, 返回新的掩膜以及被移除的个数.
    /// 调用者保证两者位于同一网格, 否则程序 panic.
    pub fn subtract(&self, other: &Mask) -> (Mask, usize) {
        assert_eq!(self.shape(), other.shape(), "掩膜形状不一致");
        let mut removed = 0usize;
        let mut data = self.data.clone();
        Zip::from(&mut data).and(&other.data).for_each(|a, b| {
            if *a && *b {
                *a = false;
                removed += 1;
            }
        });
        (
            Mask {
                grid: self.grid,
                data,
            },
            removed,
        )
    }

    /// 转换为 0/1 取值的体数据, 便于写出.
    pub fn to_volume(&self) -> Volume {
        let data = self.data.mapv(|p| if p { 1.0 } else { 0.0 });
        // 形状一致性由构造保证.
        Volume::new(self.grid, data).unwrap()
    }
}
