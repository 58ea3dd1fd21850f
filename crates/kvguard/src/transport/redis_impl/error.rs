//! Redis error mapping to KvError.

use kvguard_core::KvError;

/// Maps Redis errors to KvError.
///
/// Anything that means the socket is gone becomes `Connectivity`, which makes
/// the connection manager switch to the fallback store and reconnect.
pub fn map_redis_error(err: redis::RedisError) -> KvError {
    if err.is_connection_refusal()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_io_error()
    {
        KvError::Connectivity(err.to_string())
    } else {
        KvError::OperationFailed(err.to_string())
    }
}
