// ==============================================================================
// lib.rs - Ingestion Core Library
// ==============================================================================
// Description: Library interface for ingestion domain modules
// Author: Matt Barham
// Created: 2026-05-18
// Modified: 2026-08-02
// Version: 1.1.0
// ==============================================================================

pub mod manifest;
pub mod matcher;
pub mod models;
pub mod parsers;
pub mod validation;
