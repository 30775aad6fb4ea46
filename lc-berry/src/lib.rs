#![warn(missing_docs)]

//! 核心库. 提供 7T 多对比度 MRI 数据中蓝斑核 (locus coeruleus, LC) 的
//! 配准、掩膜构造与对比度噪声比 (CNR) 定量功能.
//!
//! 处理流程: 枚举 BIDS 被试 → 主结构像配准到 MNI 模板 → 同一变换作用于其他对比度
//! → 图谱阈值化得到 LC ROI, 构造或读入参考区 → 统计 ROI/参考区强度并计算 CNR/CR
//! → 汇总为一张结果表.
//!
//! # 注意
//!
//! 1. 所有体数据以 nifti 文件的 `(i, j, k)` 顺序索引, 物理坐标以毫米为单位.
//! 2. 所有组件以参数形式接收 [`PipelineConfig`], 不读取任何全局状态.
//! 3. 单个被试的失败不会中断整个队列, 而是被记录并跳过.
//!
//! # 开发计划
//!
//! ### BIDS 数据集枚举 ✅
//!
//! 实现位于 `lc-berry/src/dataset`.
//!
//! ### 体数据、网格与仿射矩阵 ✅
//!
//! sform 优先, 其次 qform, 最后退化为 pixdim 缩放.
//!
//! 实现位于 `lc-berry/src/data`.
//!
//! ### 配准 ✅
//!
//! 原生实现: 矩初始化 + 多分辨率对称 demons (SyN 风格).
//! 后端以 trait 形式给出, 便于替换为外部工具.
//!
//! 实现位于 `lc-berry/src/registration`.
//!
//! ### ROI 与参考区 ✅
//!
//! 参考区球体按物理距离生长, 结果在不同分辨率下体积一致.
//!
//! 实现位于 `lc-berry/src/roi`.
//!
//! ### CNR/CR 定量 ✅
//!
//! 实现位于 `lc-berry/src/extract`.
//!
//! ### 队列并行 ✅
//!
//! 被试之间相互独立, 在 `rayon` feature 下并行处理.
//!
//! 实现位于 `lc-berry/src/pipeline`.
//!
//! ### 多回波 T2* 拟合 ⌛️
//!
//! 目前 4D 多回波文件只取单个回波.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 物理空间坐标 (mm).
pub type Point3 = [f64; 3];

/// 3D nii 文件基础数据结构.
mod data;

pub use data::{Affine, Grid, GridAttr, Mask, Volume, VolumeError};

pub mod config;
pub mod consts;

pub use config::{ConfigError, PipelineConfig};

pub mod dataset;
pub mod extract;
pub mod pipeline;
pub mod registration;
pub mod roi;

pub mod prelude;
