use std::fmt::Display;
use std::fmt::Formatter;

use ccq_messages::ChainId;
use thiserror::Error;
use warp::http::StatusCode;

/// Why a request was turned away or could not be answered. The string form
/// is used as the `reason` metric label and in HTTP error bodies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    InvalidApiKey,
    RequestNotSigned,
    InvalidSignature,
    FailedToSignRequest,
    FailedToSignResponse,
    FailedToUnmarshalRequest,
    FailedToValidateRequest,
    UnsupportedQueryType,
    CallNotAuthorized,
    InvalidRequester,
    HandlerUnavailable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidApiKey => "invalid_api_key",
            RejectReason::RequestNotSigned => "request_not_signed",
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::FailedToSignRequest => "failed_to_sign_request",
            RejectReason::FailedToSignResponse => "failed_to_sign_response",
            RejectReason::FailedToUnmarshalRequest => "failed_to_unmarshal_request",
            RejectReason::FailedToValidateRequest => "failed_to_validate_request",
            RejectReason::UnsupportedQueryType => "unsupported_query_type",
            RejectReason::CallNotAuthorized => "call_not_authorized",
            RejectReason::InvalidRequester => "invalid_requester",
            RejectReason::HandlerUnavailable => "query_handler_unavailable",
        }
    }
}

impl Display for RejectReason {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum QueryError {
    #[error("unauthorized ({reason}): {message}")]
    Unauthorized {
        reason: RejectReason,
        message: String,
    },

    #[error("malformed request ({reason}): {message}")]
    Malformed {
        reason: RejectReason,
        message: String,
    },

    #[error("internal error ({reason}): {message}")]
    Internal {
        reason: RejectReason,
        message: String,
    },

    #[error("query {request_idx} is for unsupported chain {chain_id}")]
    Unsupported { request_idx: usize, chain_id: ChainId },

    #[error("query {request_idx} on chain {chain_id} failed: {message}")]
    FatalChainError {
        request_idx: usize,
        chain_id: ChainId,
        message: String,
    },

    #[error("request timed out with incomplete queries {incomplete:?}")]
    Timeout { incomplete: Vec<usize> },

    #[error("request is already being processed")]
    Duplicate,
}

impl QueryError {
    pub fn unauthorized(
        reason: RejectReason,
        message: impl Into<String>,
    ) -> Self {
        QueryError::Unauthorized {
            reason,
            message: message.into(),
        }
    }

    pub fn malformed(
        reason: RejectReason,
        message: impl Into<String>,
    ) -> Self {
        QueryError::Malformed {
            reason,
            message: message.into(),
        }
    }

    pub fn internal(
        reason: RejectReason,
        message: impl Into<String>,
    ) -> Self {
        QueryError::Internal {
            reason,
            message: message.into(),
        }
    }

    /// Stable reason code, used as a metric label and in error replies.
    pub fn reason(&self) -> &'static str {
        match self {
            QueryError::Unauthorized { reason, .. }
            | QueryError::Malformed { reason, .. }
            | QueryError::Internal { reason, .. } => reason.as_str(),
            QueryError::Unsupported { .. } => "unsupported_chain",
            QueryError::FatalChainError { .. } => "fatal_chain_error",
            QueryError::Timeout { .. } => "timeout",
            QueryError::Duplicate => "duplicate_request",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            QueryError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            QueryError::Malformed { .. } | QueryError::Unsupported { .. } => {
                StatusCode::BAD_REQUEST
            },
            QueryError::Internal { .. } | QueryError::FatalChainError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
            QueryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            QueryError::Duplicate => StatusCode::CONFLICT,
        }
    }
}
