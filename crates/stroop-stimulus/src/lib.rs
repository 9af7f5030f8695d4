//! Stroop Stimulus Engine - Randomized stimuli under the non-congruence law
//!
//! This crate implements:
//! - Color palettes (word → matching color, plus display-only colors)
//! - Timing parameters (display, interval range, countdown)
//! - Uniform and word-balanced stimulus generation
//!
//! A congruent stimulus (word drawn in its own color) is never produced.

pub mod generator;
pub mod palette;

pub use generator::*;
pub use palette::*;
