//! A UBI eraseblock association layer: stable logical eraseblocks (LEBs) on top of NAND flash
//! whose physical eraseblocks (PEBs) wear out, go bad, or get moved around.

pub mod nand;
pub mod ubi;
