//! Ajax token extraction.
//!
//! - `extract`: locates the token snippet in the page head and runs it.
//! - `normalize`: rewrites arrow-function snippets into plain functions.
//! - `sandbox`: isolated script context with browser stand-ins.

pub mod extract;
pub mod normalize;
pub mod sandbox;
