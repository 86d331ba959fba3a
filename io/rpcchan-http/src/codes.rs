//! Mapping between HTTP statuses and RPC codes.

use http::StatusCode;
use rpcchan::Code;

/// Code for a non-200 response that carried no trailer.
pub fn code_from_http_status(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 | 405 => Code::Unimplemented,
        408 => Code::DeadlineExceeded,
        413 => Code::ResourceExhausted,
        415 => Code::Internal,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_statuses() {
        assert_eq!(code_from_http_status(StatusCode::BAD_REQUEST), Code::Internal);
        assert_eq!(code_from_http_status(StatusCode::UNAUTHORIZED), Code::Unauthenticated);
        assert_eq!(code_from_http_status(StatusCode::FORBIDDEN), Code::PermissionDenied);
        assert_eq!(code_from_http_status(StatusCode::NOT_FOUND), Code::Unimplemented);
        assert_eq!(code_from_http_status(StatusCode::METHOD_NOT_ALLOWED), Code::Unimplemented);
        assert_eq!(code_from_http_status(StatusCode::REQUEST_TIMEOUT), Code::DeadlineExceeded);
        assert_eq!(code_from_http_status(StatusCode::PAYLOAD_TOO_LARGE), Code::ResourceExhausted);
        assert_eq!(
            code_from_http_status(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            Code::Internal
        );
        assert_eq!(code_from_http_status(StatusCode::TOO_MANY_REQUESTS), Code::Unavailable);
        assert_eq!(code_from_http_status(StatusCode::BAD_GATEWAY), Code::Unavailable);
        assert_eq!(code_from_http_status(StatusCode::SERVICE_UNAVAILABLE), Code::Unavailable);
        assert_eq!(code_from_http_status(StatusCode::GATEWAY_TIMEOUT), Code::Unavailable);
    }

    #[test]
    fn test_everything_else_is_unknown() {
        assert_eq!(code_from_http_status(StatusCode::INTERNAL_SERVER_ERROR), Code::Unknown);
        assert_eq!(code_from_http_status(StatusCode::IM_A_TEAPOT), Code::Unknown);
        assert_eq!(code_from_http_status(StatusCode::MOVED_PERMANENTLY), Code::Unknown);
        assert_eq!(code_from_http_status(StatusCode::NO_CONTENT), Code::Unknown);
    }
}
