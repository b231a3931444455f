//! Submission-coalescing and change-detection pipeline.
//!
//! Inbound snapshots flow through [`coalescer::Coalescer`], which debounces
//! bursts per place, then through [`detector`], which drops near-duplicates,
//! into a [`store::FrameStore`]. [`diff`] and [`timelapse`] derive visual
//! artifacts from the stored history on demand.

pub mod coalescer;
pub mod detector;
pub mod diff;
pub mod store;
pub mod timelapse;
