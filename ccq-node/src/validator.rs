//! Admission checks for incoming requests: caller identity, signatures,
//! request format and per call permissions. Nothing is dispatched for a
//! request that fails here.
use std::sync::Arc;

use ccq_auth::recover_signer;
use ccq_auth::AllowedRequesters;
use ccq_auth::DigestSigner;
use ccq_auth::SIGNATURE_LEN;
use ccq_messages::query_request_digest;
use ccq_messages::CodecError;
use ccq_messages::Environment;
use ccq_messages::QueryRequest;
use ccq_messages::RequestId;
use ccq_messages::SignedQueryRequest;
use tracing::debug;
use tracing::warn;

use crate::error::QueryError;
use crate::error::RejectReason;
use crate::metrics::Metrics;
use crate::permissions::call_keys;
use crate::permissions::PermissionTable;

/// A request which passed every admission check.
#[derive(Clone, Debug)]
pub struct ValidatedRequest {
    pub request_id: RequestId,
    pub signed_request: SignedQueryRequest,
    pub query_request: QueryRequest,
    pub user_name: String,
}

#[derive(Clone, Debug)]
pub struct RequestValidator {
    environment: Environment,
    permissions: Arc<PermissionTable>,
    /// Co-signs unsigned requests of callers with `allowUnsigned`.
    signer: Option<DigestSigner>,
    allowed_requesters: Option<AllowedRequesters>,
    metrics: Metrics,
}

impl RequestValidator {
    pub fn new(
        environment: Environment,
        permissions: Arc<PermissionTable>,
        signer: Option<DigestSigner>,
        allowed_requesters: Option<AllowedRequesters>,
        metrics: Metrics,
    ) -> Self {
        Self {
            environment,
            permissions,
            signer,
            allowed_requesters,
            metrics,
        }
    }

    pub fn validate(
        &self,
        api_key: &str,
        signed_request: SignedQueryRequest,
    ) -> Result<ValidatedRequest, QueryError> {
        self.check(api_key, signed_request).inspect_err(|err| {
            self.metrics.increment_invalid_requests(err.reason());
        })
    }

    fn check(
        &self,
        api_key: &str,
        mut signed_request: SignedQueryRequest,
    ) -> Result<ValidatedRequest, QueryError> {
        let Some(permissions) = self.permissions.get(api_key) else {
            debug!("invalid api key");
            return Err(QueryError::unauthorized(
                RejectReason::InvalidApiKey,
                "invalid api key",
            ));
        };
        let user_name = permissions.user_name.clone();

        let digest = query_request_digest(self.environment, &signed_request.query_request);

        if !signed_request.is_signed() {
            let signer = match &self.signer {
                Some(signer) if permissions.allow_unsigned => signer,
                _ => {
                    debug!(%user_name, "request not signed");
                    return Err(QueryError::malformed(
                        RejectReason::RequestNotSigned,
                        "request not signed",
                    ));
                },
            };
            let signature = signer.sign(&digest).map_err(|err| {
                warn!(%user_name, "failed to sign request: {err:?}");
                QueryError::internal(RejectReason::FailedToSignRequest, "failed to sign request")
            })?;
            signed_request.signature = signature.to_vec();
        }

        if signed_request.signature.len() != SIGNATURE_LEN {
            debug!(
                %user_name,
                len = signed_request.signature.len(),
                "invalid signature length"
            );
            return Err(QueryError::malformed(
                RejectReason::InvalidSignature,
                format!("signature must be {SIGNATURE_LEN} bytes"),
            ));
        }

        if let Some(allowed) = &self.allowed_requesters {
            match recover_signer(&digest, &signed_request.signature) {
                Ok(requester) if allowed.contains(&requester) => {},
                Ok(requester) => {
                    debug!(%user_name, %requester, "requester not allowed");
                    return Err(QueryError::unauthorized(
                        RejectReason::InvalidRequester,
                        "requester is not allowed",
                    ));
                },
                Err(err) => {
                    debug!(%user_name, "failed to recover requester: {err:?}");
                    return Err(QueryError::unauthorized(
                        RejectReason::InvalidRequester,
                        "failed to recover requester",
                    ));
                },
            }
        }

        let query_request =
            QueryRequest::unmarshal(&signed_request.query_request).map_err(|err| {
                debug!(%user_name, "failed to unmarshal request: {err}");
                match err {
                    CodecError::UnsupportedQueryType(tag) => {
                        QueryError::malformed(
                            RejectReason::UnsupportedQueryType,
                            format!("unsupported query type {tag}"),
                        )
                    },
                    _ => {
                        QueryError::malformed(
                            RejectReason::FailedToUnmarshalRequest,
                            "failed to unmarshal request",
                        )
                    },
                }
            })?;

        query_request.validate().map_err(|err| {
            debug!(%user_name, "failed to validate request: {err}");
            QueryError::malformed(RejectReason::FailedToValidateRequest, err.to_string())
        })?;

        let mut requested_calls = Vec::new();
        for pcq in &query_request.per_chain_queries {
            for call_key in call_keys(pcq) {
                if !permissions.is_allowed(&call_key) {
                    debug!(%user_name, %call_key, "call not authorized");
                    return Err(QueryError::unauthorized(
                        RejectReason::CallNotAuthorized,
                        format!("call \"{call_key}\" not authorized"),
                    ));
                }
                requested_calls.push(pcq.chain_id);
            }
        }
        // Only admitted requests count towards the per chain call totals.
        for chain_id in requested_calls {
            self.metrics.increment_requested_calls(chain_id);
        }

        Ok(ValidatedRequest {
            request_id: RequestId::from_digest(&digest),
            signed_request,
            query_request,
            user_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;
    use ccq_messages::request::EthCallData;
    use ccq_messages::request::EthCallQueryRequest;
    use ccq_messages::ChainId;
    use ccq_messages::ChainSpecificQuery;
    use ccq_messages::PerChainQueryRequest;

    use super::*;

    const PERMISSIONS: &str = include_str!("../permissions.example.json");

    fn contract() -> Address {
        "0xB4FBF271143F4FBf7B91A5ded31805e42b2208d6"
            .parse()
            .unwrap()
    }

    fn eth_call_request(
        chain_id: ChainId,
        selector: [u8; 4],
    ) -> QueryRequest {
        QueryRequest::new(
            42,
            vec![PerChainQueryRequest::new(
                chain_id,
                ChainSpecificQuery::EthCall(EthCallQueryRequest {
                    block_id: "0x28d9630".to_string(),
                    call_data: vec![EthCallData::new(contract(), selector.to_vec())],
                }),
            )],
        )
    }

    fn validator(
        signer: Option<DigestSigner>,
        allowed_requesters: Option<AllowedRequesters>,
    ) -> RequestValidator {
        RequestValidator::new(
            Environment::TestNet,
            Arc::new(PermissionTable::parse(PERMISSIONS).unwrap()),
            signer,
            allowed_requesters,
            Metrics::new(),
        )
    }

    fn signed(
        requester: &DigestSigner,
        request: &QueryRequest,
    ) -> SignedQueryRequest {
        let bytes = request.marshal().unwrap();
        let digest = query_request_digest(Environment::TestNet, &bytes);
        SignedQueryRequest::new(bytes, requester.sign(&digest).unwrap().to_vec())
    }

    #[test]
    fn test_accepts_authorized_request() {
        let requester = DigestSigner::random();
        let request = eth_call_request(ChainId::ETHEREUM, [0x06, 0xfd, 0xde, 0x03]);
        let signed = signed(&requester, &request);

        let validated = validator(None, None)
            .validate("my_secret_key", signed.clone())
            .unwrap();
        assert_eq!(validated.user_name, "Test User");
        assert_eq!(validated.query_request, request);
        assert_eq!(validated.signed_request, signed);
        assert_eq!(
            validated.request_id,
            RequestId::from_digest(&query_request_digest(
                Environment::TestNet,
                &signed.query_request
            ))
        );
    }

    #[test]
    fn test_rejects_unknown_api_key() {
        let request = eth_call_request(ChainId::ETHEREUM, [0x06, 0xfd, 0xde, 0x03]);
        let err = validator(None, None)
            .validate("bogus", signed(&DigestSigner::random(), &request))
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Unauthorized {
                reason: RejectReason::InvalidApiKey,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_unauthorized_call() {
        let requester = DigestSigner::random();
        let wrong_selector = eth_call_request(ChainId::ETHEREUM, [0xde, 0xad, 0xbe, 0xef]);
        let wrong_chain = eth_call_request(ChainId::POLYGON, [0x06, 0xfd, 0xde, 0x03]);

        for request in [wrong_selector, wrong_chain] {
            let err = validator(None, None)
                .validate("my_secret_key", signed(&requester, &request))
                .unwrap_err();
            assert_eq!(err.reason(), "call_not_authorized");
            assert_eq!(err.status_code(), warp::http::StatusCode::FORBIDDEN);
        }
    }

    #[test]
    fn test_unsigned_requests() {
        let request = eth_call_request(ChainId::ETHEREUM, [0x06, 0xfd, 0xde, 0x03]);
        let unsigned = SignedQueryRequest::new(request.marshal().unwrap(), vec![]);

        // Not allowed for this user, even with a co-signer.
        let err = validator(Some(DigestSigner::random()), None)
            .validate("my_secret_key", unsigned.clone())
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Malformed {
                reason: RejectReason::RequestNotSigned,
                ..
            }
        ));

        // Allowed for this user, but nobody to co-sign.
        let local = QueryRequest::new(
            1,
            vec![PerChainQueryRequest::new(
                ChainId::POLYGON,
                ChainSpecificQuery::EthCall(EthCallQueryRequest {
                    block_id: "0x28d9630".to_string(),
                    call_data: vec![EthCallData::new(contract(), vec![0x31, 0x3c, 0xe5, 0x67])],
                }),
            )],
        );
        let unsigned_local = SignedQueryRequest::new(local.marshal().unwrap(), vec![]);
        let err = validator(None, None)
            .validate("my_other_key", unsigned_local)
            .unwrap_err();
        assert_eq!(err.reason(), "request_not_signed");
    }

    #[test]
    fn test_co_signs_unsigned_request() {
        let co_signer = DigestSigner::random();
        let request = QueryRequest::new(
            1,
            vec![PerChainQueryRequest::new(
                ChainId::POLYGON,
                ChainSpecificQuery::EthCallWithFinality(
                    ccq_messages::request::EthCallWithFinalityQueryRequest {
                        block_id: "0x28d9630".to_string(),
                        finality: "finalized".to_string(),
                        call_data: vec![EthCallData::new(
                            "0x0d500b1d8e8ef31e21c99d1db9a6444d3adf1270".parse().unwrap(),
                            vec![0x06, 0xfd, 0xde, 0x03],
                        )],
                    },
                ),
            )],
        );
        let unsigned = SignedQueryRequest::new(request.marshal().unwrap(), vec![]);

        let allowed = AllowedRequesters::new([co_signer.address()]);
        let validated = validator(Some(co_signer.clone()), Some(allowed))
            .validate("my_other_key", unsigned.clone())
            .unwrap();
        assert_eq!(validated.signed_request.signature.len(), 65);
        let digest = query_request_digest(Environment::TestNet, &unsigned.query_request);
        assert_eq!(
            recover_signer(&digest, &validated.signed_request.signature).unwrap(),
            co_signer.address()
        );
    }

    #[test]
    fn test_requester_allow_list() {
        let allowed_signer = DigestSigner::random();
        let allowed = AllowedRequesters::new([allowed_signer.address()]);
        let validator = validator(None, Some(allowed));
        let request = eth_call_request(ChainId::ETHEREUM, [0x06, 0xfd, 0xde, 0x03]);

        assert!(validator
            .validate("my_secret_key", signed(&allowed_signer, &request))
            .is_ok());

        let err = validator
            .validate("my_secret_key", signed(&DigestSigner::random(), &request))
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_requester");

        // Right length, but not a valid signature.
        let garbage = SignedQueryRequest::new(request.marshal().unwrap(), vec![0xff; 65]);
        let err = validator.validate("my_secret_key", garbage).unwrap_err();
        assert_eq!(err.reason(), "invalid_requester");
    }

    #[test]
    fn test_malformed_requests() {
        let requester = DigestSigner::random();
        let validator = validator(None, None);
        let sign_bytes = |bytes: Vec<u8>| {
            let digest = query_request_digest(Environment::TestNet, &bytes);
            SignedQueryRequest::new(bytes, requester.sign(&digest).unwrap().to_vec())
        };

        let err = validator
            .validate("my_secret_key", sign_bytes(vec![1, 0, 0]))
            .unwrap_err();
        assert_eq!(err.reason(), "failed_to_unmarshal_request");

        // Version 1, nonce, one query on chain 2 with type tag 0x7f.
        let err = validator
            .validate(
                "my_secret_key",
                sign_bytes(vec![1, 0, 0, 0, 1, 1, 0, 2, 0x7f, 0, 0, 0, 0]),
            )
            .unwrap_err();
        assert_eq!(err.reason(), "unsupported_query_type");

        let empty = QueryRequest::new(1, vec![]);
        let err = validator
            .validate("my_secret_key", sign_bytes(empty.marshal().unwrap()))
            .unwrap_err();
        assert_eq!(err.reason(), "failed_to_validate_request");
        assert_eq!(err.status_code(), warp::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_rejects_bad_signature_length() {
        let request = eth_call_request(ChainId::ETHEREUM, [0x06, 0xfd, 0xde, 0x03]);
        let validator = validator(None, None);

        for signature in [vec![1, 2, 3], vec![0x11; 66]] {
            let err = validator
                .validate(
                    "my_secret_key",
                    SignedQueryRequest::new(request.marshal().unwrap(), signature),
                )
                .unwrap_err();
            assert_eq!(err.reason(), "invalid_signature");
            assert_eq!(err.status_code(), warp::http::StatusCode::BAD_REQUEST);
        }
    }
}
