//! Protocol-wide constants for circuit-relay.
//!
//! Every tunable here has a matching field in [`crate::config::Config`];
//! these values are the defaults used when no config file or environment
//! override is present.
//!
//! # Categories
//!
//! - **Batch ids**: numbering of render batches
//! - **Delivery**: retry ceilings and intervals for batch and ack sends
//! - **Retention**: how long a disconnected circuit is kept alive
//! - **Reconnection**: client-side backoff

use std::time::Duration;

// ============================================================================
// Batch ids
// ============================================================================

/// First batch id transmitted on a renderer stream.
///
/// Id 1 is implicitly consumed by the prerendered markup the client already
/// has, so it is never sent.
pub const FIRST_BATCH_ID: u64 = 2;

// ============================================================================
// Delivery
// ============================================================================

/// Maximum transmissions of one render batch before it is declared lost.
pub const MAX_BATCH_SEND_ATTEMPTS: u32 = 3;

/// Pause between a failed transmission and the next attempt.
pub const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// How long a transmitted batch waits for its acknowledgement before it is
/// sent again.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(3000);

/// Maximum attempts to deliver one acknowledgement from the client.
pub const ACK_SEND_ATTEMPTS: u32 = 3;

/// Pause between failed acknowledgement sends.
pub const ACK_RETRY_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Retention
// ============================================================================

/// Grace period a circuit survives without a connection before eviction.
pub const DISCONNECTED_CIRCUIT_RETENTION: Duration = Duration::from_secs(180);

// ============================================================================
// Reconnection
// ============================================================================

/// Attempts made by the auto-reconnect loop before giving up.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 8;

/// First backoff delay of the auto-reconnect loop.
pub const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Cap on the auto-reconnect backoff delay.
pub const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Upper bound of the random jitter added to each backoff delay.
pub const RECONNECT_JITTER_MS: u64 = 250;
