//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Point3};

pub use crate::data::{Affine, Grid, GridAttr, Mask, Volume, VolumeError};

pub use crate::config::{ContrastPattern, PipelineConfig, RegistrationSettings};
pub use crate::consts::contrast;

pub use crate::dataset::{
    self, discover_subject, find_contrast_file, home_dataset_dir_with, list_subjects,
};

pub use crate::registration::{
    apply_transform, register_subject, register_to_template, Interpolation, NativeBackend,
    RegisteredSubject, RegistrationBackend, RegistrationParams, Transform,
};

pub use crate::roi::{load_or_create_reference, threshold_atlas};

pub use crate::extract::{compute_cnr, extract_roi_stats, CnrStats, ExtractionRecord, RoiStats};

pub use crate::pipeline::{run_cohort, CohortMasks, CohortReport};
