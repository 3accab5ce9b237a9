//! Core library modules for slidestitch
//!
//! Leaf modules first: geometry and sources feed the dispatcher, which writes
//! into the canvas store; the level merger sequences fragments and the batch
//! driver runs whole slides.

pub mod batch;
pub mod canvas;
pub mod color;
pub mod coverage;
pub mod dispatch;
pub mod error;
pub mod fill;
pub mod fragment_file;
pub mod geometry;
pub mod level;
pub mod pyramid;
pub mod source;
