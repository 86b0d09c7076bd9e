//! Pose smoothing
//!
//! Raw marker poses jitter from frame to frame; every tracked marker runs its
//! pose through a [`OneEuroFilter`] before the renderer sees it.

mod one_euro;

pub use one_euro::{FilterParams, OneEuroFilter};
