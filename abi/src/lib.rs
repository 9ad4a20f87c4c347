//! Shared types for the nveth packet movement engine.
//!
//! This crate holds the plain vocabulary passed between the buffer crate and
//! the driver crate: bus addresses, DMA directions, channel identifiers and
//! the constants that size rings and descriptor batches. It has no logic
//! beyond small conversions.

#![no_std]
#![forbid(unsafe_code)]

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod dma;

pub use addr::*;
pub use dma::*;
