//! Image-stack handling for calibration sweeps.
//!
//! # Module Organization
//!
//! - **stack**: planar `u16` stacks as returned by one detection arm
//! - **metrics**: per-plane quality metrics (DCT Shannon entropy, robust
//!   intensity) and brightest-region centroids
//! - **recycler**: bounded pool of duplicated stacks with scoped release
//!
//! Metrics reduce a stack to one value per plane, so a sweep of `n` frames
//! yields an `n`-sample curve ready for peak fitting.

pub mod metrics;
pub mod recycler;
pub mod stack;

pub use metrics::{
    brightest_points_centroid, clean_with_min, dcts_per_plane, normalized_centroid,
    percentile_intensity_per_plane, DCTS_DEFAULT_PSF_SUPPORT,
};
pub use recycler::{RecycledStack, StackRecycler};
pub use stack::ImageStack;
