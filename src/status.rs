//! Translation from gRPC status codes to HTTP-style outcome codes.
//!
//! Telemetry consumers bucket requests by HTTP numbering, so every tracked
//! call reports a canonical outcome code regardless of transport.

use tonic::Code;

/// Canonical outcome code (HTTP numbering).
pub type OutcomeCode = u16;

/// Outcome codes below this value count as successful.
pub const SUCCESS_THRESHOLD: OutcomeCode = 400;

/// Map a gRPC status code to its canonical outcome code.
///
/// Total: codes without a dedicated mapping translate to 500.
pub fn translate(code: Code) -> OutcomeCode {
    match code {
        Code::Ok => 200,
        Code::InvalidArgument | Code::OutOfRange => 400,
        Code::Unauthenticated => 401,
        Code::PermissionDenied => 403,
        Code::NotFound => 404,
        Code::DeadlineExceeded => 408,
        Code::AlreadyExists => 409,
        Code::FailedPrecondition => 412,
        Code::ResourceExhausted => 429,
        Code::Unimplemented => 501,
        _ => 500,
    }
}

/// Whether an outcome code represents success.
pub fn is_success(code: OutcomeCode) -> bool {
    code < SUCCESS_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_codes() {
        let cases = [
            (Code::AlreadyExists, 409),
            (Code::DeadlineExceeded, 408),
            (Code::FailedPrecondition, 412),
            (Code::InvalidArgument, 400),
            (Code::NotFound, 404),
            (Code::Ok, 200),
            (Code::OutOfRange, 400),
            (Code::PermissionDenied, 403),
            (Code::ResourceExhausted, 429),
            (Code::Unauthenticated, 401),
            (Code::Unimplemented, 501),
        ];

        for (code, expected) in cases {
            assert_eq!(translate(code), expected, "{:?}", code);
        }
    }

    #[test]
    fn test_unmapped_codes_are_server_errors() {
        for code in [
            Code::Unknown,
            Code::Internal,
            Code::Cancelled,
            Code::Aborted,
            Code::Unavailable,
            Code::DataLoss,
        ] {
            assert_eq!(translate(code), 500, "{:?}", code);
        }
    }

    #[test]
    fn test_unrecognized_raw_code_is_server_error() {
        assert_eq!(translate(Code::from_i32(99)), 500);
    }

    #[test]
    fn test_success_boundary() {
        assert!(is_success(translate(Code::Ok)));
        assert!(is_success(399));
        assert!(!is_success(400));
        assert!(!is_success(translate(Code::NotFound)));
    }
}
