#![doc = include_str!("../README.md")]

pub mod framing;
pub mod runtime;
pub mod sampler;
