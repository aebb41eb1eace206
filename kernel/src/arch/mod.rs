//! Architecture support. This crate targets x86_64 exclusively.

pub mod barriers;
pub mod x86_64;

pub use x86_64::*;
