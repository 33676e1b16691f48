//! Protocol and transport constants.
//!
//! Values the server contract fixes (goal tags, result codes) live next to the
//! tunable defaults used by the config builders.

use std::time::Duration;

use ::http::header::{AUTHORIZATION, HeaderName};

// =============================================================================
// RESULT CODES (HTTP envelope and socket replies)
// =============================================================================

/// Result code reported by the server on success.
pub const RESULT_CODE_SUCCESS: i64 = 0;

/// Result code reported when the credential is missing, expired or revoked.
pub const RESULT_CODE_UNAUTHORIZED: i64 = 2;

/// Field carrying the result code in every response body.
pub const RESULT_CODE_FIELD: &str = "resultCode";

/// Field carrying the optional human-readable result message.
pub const RESULT_CODE_MESSAGE_FIELD: &str = "resultCodeMessage";

// =============================================================================
// PACKET GOALS (subscription protocol)
// =============================================================================

/// Authenticate the socket session.
pub const GOAL_AUTH: u8 = 1;

/// Announce client presence.
pub const GOAL_PRESENCE: u8 = 2;

/// Open a subscription.
pub const GOAL_SUBSCRIBE: u8 = 3;

/// Close a subscription.
pub const GOAL_UNSUBSCRIBE: u8 = 4;

/// Query connection status.
pub const GOAL_STATUS: u8 = 5;

/// Server push for an established subscription.
pub const GOAL_DATA: u8 = 6;

// =============================================================================
// SUBSCRIPTION OPERATIONS
// =============================================================================

/// Entity created.
pub const OPERATION_CREATE: u8 = 1;

/// Entity updated.
pub const OPERATION_UPDATE: u8 = 2;

/// Entity deleted.
pub const OPERATION_DELETE: u8 = 4;

// =============================================================================
// REQUEST PIPELINE
// =============================================================================

/// Fixed API segment joined between the base URL and the request path.
pub const DEFAULT_API_PREFIX: &str = "api/v1";

/// Default per-request timeout applied by the HTTP transport.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default credential header.
pub const DEFAULT_CREDENTIAL_HEADER: HeaderName = AUTHORIZATION;

/// Default credential scheme prefixed to the token.
pub const DEFAULT_CREDENTIAL_SCHEME: &str = "Bearer";

/// Body field carrying the credential expiry (epoch milliseconds).
pub const DEFAULT_EXPIRY_FIELD: &str = "tokenExpiresAt";

// =============================================================================
// RESILIENCE
// =============================================================================

/// Silent replays allowed for one caller-visible request.
pub const MAX_RETRIES: u32 = 3;

/// HTTP statuses treated as "server unavailable".
///
/// A missing status (no response at all) is always treated as unavailable.
pub const UNAVAILABLE_STATUSES: &[u16] = &[502, 503, 504, 520, 521, 522, 523, 524];

/// Paths never replayed: availability probes and terminal session actions.
pub const EXEMPT_PATHS: &[&str] = &["status/ping", "auth/login", "auth/logout"];

/// Availability endpoint polled by the connectivity probe.
pub const DEFAULT_PROBE_PATH: &str = "status/ping";

/// Interval between availability probes while offline.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// SOCKET
// =============================================================================

/// How long a packet waits for its reply before being rejected.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the outbound frame queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
