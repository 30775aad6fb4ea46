//! 通用常量.

/// BIDS 目录中被试文件夹的前缀.
pub const SUBJECT_PREFIX: &str = "sub-";

/// 配准到模板空间后, 输出文件名的后缀 (不含扩展名).
pub const TEMPLATE_SPACE_TAG: &str = "MNI";

/// nii 压缩文件扩展名.
pub const NII_GZ: &str = "nii.gz";

/// 结果表文件名.
pub const RECORDS_FILENAME: &str = "lc_cnr.csv";

/// 默认对比度名称.
pub mod contrast {
    /// 主结构像, 配准以其为准.
    pub const T1W: &str = "T1w";

    /// 纵向弛豫率图.
    pub const R1: &str = "R1";

    /// 有效横向弛豫率图.
    pub const R2STAR: &str = "R2star";

    /// 定量磁化率图.
    pub const QSM: &str = "QSM";

    /// T2* 加权幅值像.
    pub const T2STARW: &str = "T2starw";
}
