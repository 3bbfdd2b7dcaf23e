//! Numeric error codes for the message-framed control plane.
//!
//! Standard JSON-RPC codes plus the kernel's domain range (-32001..-32007).

/// Frame was not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Frame was JSON but not a valid request.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Params failed to deserialize or a required field was missing.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal failure; reason is masked.
pub const INTERNAL_ERROR: i64 = -32603;

/// Token mismatch or a non-connect call before authentication.
pub const AUTH_FAILED: i64 = -32001;
/// Caller's capability set does not include the method.
pub const PERMISSION_DENIED: i64 = -32002;
/// Expected window is not focused.
pub const FOCUS_MISMATCH: i64 = -32003;
/// Proposal blocked on risk grounds.
pub const RISK_BLOCKED: i64 = -32004;
/// Request deadline elapsed.
pub const TIMEOUT: i64 = -32005;
/// Wake/talk toggle failed.
pub const VOICE_ERROR: i64 = -32006;
/// Memory store/search failed.
pub const MEMORY_ERROR: i64 = -32007;
