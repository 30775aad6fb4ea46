use std::collections::HashSet;

use binary_heap_plus::BinaryHeap;

use crate::{Grid, GridAttr, Idx3d, Point3};

/// 在任意网格上按物理距离提取球形区域.
///
/// 轴对齐网格上, 从距球心最近的体素出发, 以 6-邻域向外扩展; 堆顶始终是距球心最近的候选体素,
/// 因此一旦堆顶超出半径即可停止. 斜切网格上球内体素不一定 6-连通, 改为扫描球的索引包围盒.
/// 距离在物理空间中计算, 结果与体素分辨率和方向无关.
pub struct SphereGenerator<'a> {
    grid: &'a Grid,
    center: Point3,
}

impl<'a> SphereGenerator<'a> {
    /// 以物理坐标 `center` (mm) 为球心.
    pub fn new(grid: &'a Grid, center: Point3) -> Self {
        Self { grid, center }
    }

    /// 体素 `pos` 中心到球心的距离的平方, 单位为 (mm)^2.
    #[inline]
    fn center_distance_squared(&self, pos: &Idx3d) -> f64 {
        let p = self.grid.to_physical(*pos);
        (0..3).map(|a| (p[a] - self.center[a]).powi(2)).sum()
    }

    /// 距球心最近的体素. 若球心在网格外, 取夹紧到网格内的体素.
    fn seed(&self) -> Option<Idx3d> {
        let inv = self.grid.affine().inverse()?;
        let [x, y, z] = inv.apply(self.center);
        let (nx, ny, nz) = self.grid.shape();
        let clamp = |v: f64, n: usize| v.round().clamp(0.0, (n - 1) as f64) as usize;
        Some((clamp(x, nx), clamp(y, ny), clamp(z, nz)))
    }

    /// 线性部分是否只有对角元 (允许轴翻转).
    fn is_axis_aligned(&self) -> bool {
        let lin = self.grid.affine().linear();
        let scale = lin.amax();
        (0..3).all(|r| (0..3).all(|c| r == c || lin[(r, c)].abs() <= scale * 1e-9))
    }

    /// 提取半径不大于 `radius` (mm) 的球内所有体素的索引.
    ///
    /// 球与网格不相交时返回空 `Vec`.
    pub fn extract(&self, radius: f64) -> Vec<Idx3d> {
        if self.is_axis_aligned() {
            self.flood(radius)
        } else {
            self.scan(radius)
        }
    }

    /// 逐个检查球在索引空间中的包围盒.
    fn scan(&self, radius: f64) -> Vec<Idx3d> {
        let Some(inv) = self.grid.affine().inverse() else {
            return vec![];
        };
        let r2 = radius.powi(2);
        let c = inv.apply(self.center);
        let lin = inv.linear();
        let (nx, ny, nz) = self.grid.shape();
        let range = |a: usize, n: usize| {
            let h = radius * lin.row(a).norm();
            let lo = (c[a] - h).floor().max(0.0);
            let hi = (c[a] + h).ceil().min(n as f64 - 1.0);
            if hi < lo {
                0..0
            } else {
                lo as usize..hi as usize + 1
            }
        };

        let mut ans = Vec::new();
        for i in range(0, nx) {
            for j in range(1, ny) {
                for k in range(2, nz) {
                    if self.center_distance_squared(&(i, j, k)) <= r2 {
                        ans.push((i, j, k));
                    }
                }
            }
        }
        ans
    }

    /// 从最近体素出发按距离升序扩展.
    fn flood(&self, radius: f64) -> Vec<Idx3d> {
        let Some(seed) = self.seed() else {
            return vec![];
        };
        let r2 = radius.powi(2);

        // 堆顶距 `self.center` 最近
        let mut heap: BinaryHeap<Idx3d, _> = BinaryHeap::new_by(|a, b| {
            self.center_distance_squared(b)
                .total_cmp(&self.center_distance_squared(a))
        });
        heap.reserve(64);
        heap.push(seed);
        let mut ans = Vec::with_capacity(64);
        let mut visited = HashSet::<Idx3d>::with_capacity(64);

        while let Some(pos) = heap.pop() {
            if self.center_distance_squared(&pos) > r2 {
                break;
            }
            if !visited.insert(pos) {
                continue;
            }
            ans.push(pos);

            for neigh in self.grid.diamond_neighbours(pos) {
                if !visited.contains(&neigh) {
                    heap.push(neigh);
                }
            }
        }
        ans.shrink_to_fit();
        ans
    }
}
