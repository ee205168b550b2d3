//! Skipchain - a collectively-signed, append-only chain of blocks
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Chain
//! - [`blockchain`] - Skip blocks, forward links, rosters and chain verification
//! - [`store`] - Block store and successor construction
//! - [`persistence`] - Database layer (SQLite)
//!
//! ## Cryptography
//! - [`crypto`] - Key pairs and collective signatures (secp256k1)
//!
//! ## Distribution
//! - [`streaming`] - Live block notifications
//! - [`pagination`] - Paged retrieval of chain history
//! - [`cancel`] - Cancellation signals for long-lived requests
//! - [`service`] - The serving component tying everything together
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Chain
// ============================================================================
pub mod blockchain;
pub mod persistence;
pub mod store;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Distribution
// ============================================================================
pub mod cancel;
pub mod pagination;
pub mod service;
pub mod streaming;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
