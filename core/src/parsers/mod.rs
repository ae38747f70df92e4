// ==============================================================================
// mod.rs - File Format Processors
// ==============================================================================
// Description: Parsers for lab instrument outputs and pipeline artifacts
// Author: Matt Barham
// Created: 2026-05-22
// Modified: 2026-08-02
// Version: 1.0.0
// ==============================================================================

pub mod maf;
pub mod metadata;
pub mod npx;
pub mod sheet;
pub mod table;
