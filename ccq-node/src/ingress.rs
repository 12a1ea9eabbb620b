//! HTTP front end: accepts signed query requests, waits for their outcome,
//! and serves the readiness and liveness probes.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ccq_messages::RequestId;
use ccq_messages::SignedQueryRequest;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

use crate::error::QueryError;
use crate::error::RejectReason;
use crate::handler::QueryOutcome;
use crate::handler::QuerySubmitter;
use crate::metrics::Metrics;
use crate::validator::RequestValidator;

const MAX_BODY_SIZE: u64 = 1024 * 1024;

/// Hex encoded request envelope.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct QueryRequestBody {
    pub bytes: String,
    pub signature: String,
}

/// Hex encoded signed response.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct QueryResponseBody {
    pub bytes: String,
    pub signature: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

/// Callers waiting on the outcome of their request.
pub type Waiters = Arc<Mutex<HashMap<RequestId, oneshot::Sender<QueryOutcome>>>>;

#[derive(Clone)]
pub struct Ingress {
    validator: Arc<RequestValidator>,
    submitter: QuerySubmitter,
    waiters: Waiters,
    response_timeout: Duration,
    metrics: Metrics,
}

impl Ingress {
    pub fn new(
        validator: RequestValidator,
        submitter: QuerySubmitter,
        response_timeout: Duration,
    ) -> Self {
        Self {
            validator: Arc::new(validator),
            submitter,
            waiters: Waiters::default(),
            response_timeout,
            metrics: Metrics::new(),
        }
    }

    pub fn waiters(&self) -> Waiters {
        Arc::clone(&self.waiters)
    }

    /// `POST /v1/query` plus the health probes.
    pub fn routes(self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let submitter = self.submitter.clone();
        let ingress = self;
        let query = warp::post()
            .and(warp::path!("v1" / "query"))
            .and(warp::header::optional::<String>("x-api-key"))
            .and(warp::body::content_length_limit(MAX_BODY_SIZE))
            .and(warp::body::bytes())
            .then(move |api_key: Option<String>, body: Bytes| {
                let ingress = ingress.clone();
                async move {
                    ingress
                        .handle_query(&api_key.unwrap_or_default(), &body)
                        .await
                }
            });

        query.or(health_routes(submitter))
    }

    #[tracing::instrument(skip_all, name = "query_request", fields(request_id = tracing::field::Empty))]
    async fn handle_query(
        &self,
        api_key: &str,
        body: &[u8],
    ) -> Response {
        let signed_request = match decode_body(body) {
            Ok(signed_request) => signed_request,
            Err(err) => {
                self.metrics.increment_invalid_requests(err.reason());
                return error_reply(&err);
            },
        };

        let validated = match self.validator.validate(api_key, signed_request) {
            Ok(validated) => validated,
            Err(err) => return error_reply(&err),
        };
        let request_id = validated.request_id.clone();
        tracing::Span::current().record("request_id", request_id.as_str());

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().await;
            if waiters.contains_key(&request_id) {
                debug!(%request_id, "request already in flight");
                self.metrics
                    .increment_requests_failed(QueryError::Duplicate.reason());
                return error_reply(&QueryError::Duplicate);
            }
            waiters.insert(request_id.clone(), tx);
        }

        if let Err(err) = self.submitter.submit(validated).await {
            self.waiters.lock().await.remove(&request_id);
            return error_reply(&err);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(QueryOutcome::Published { response, .. })) => {
                warp::reply::with_status(
                    warp::reply::json(&QueryResponseBody {
                        bytes: hex::encode(&response.bytes),
                        signature: hex::encode(&response.signature),
                    }),
                    StatusCode::OK,
                )
                .into_response()
            },
            Ok(Ok(QueryOutcome::Failed { error, .. })) => error_reply(&error),
            Ok(Err(_)) => {
                warn!(%request_id, "query handler dropped the request");
                error_reply(&QueryError::internal(
                    RejectReason::HandlerUnavailable,
                    "query handler dropped the request",
                ))
            },
            Err(_) => {
                self.waiters.lock().await.remove(&request_id);
                debug!(%request_id, "timed out waiting for query response");
                error_reply(&QueryError::Timeout { incomplete: vec![] })
            },
        }
    }
}

/// Forwards outcomes from the query handler to whoever waits on them.
pub async fn route_outcomes(
    mut outcomes: mpsc::Receiver<QueryOutcome>,
    waiters: Waiters,
) {
    while let Some(outcome) = outcomes.recv().await {
        let waiter = waiters.lock().await.remove(outcome.request_id());
        match waiter {
            Some(waiter) => {
                if waiter.send(outcome).is_err() {
                    debug!("waiter went away before the outcome arrived");
                }
            },
            None => debug!(request_id = %outcome.request_id(), "no waiter for outcome"),
        }
    }
    debug!("outcome channel closed");
}

/// Readiness always answers; liveness fails once the query handler is gone.
pub fn health_routes(
    submitter: QuerySubmitter,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let readiness_route =
        warp::path!("readiness").map(|| warp::reply::with_status("OK", StatusCode::OK));
    let liveness_route = warp::path!("liveness").map(move || {
        if submitter.is_running() {
            warp::reply::with_status("OK", StatusCode::OK)
        } else {
            warp::reply::with_status("FAIL", StatusCode::INTERNAL_SERVER_ERROR)
        }
    });
    readiness_route.or(liveness_route)
}

fn decode_body(body: &[u8]) -> Result<SignedQueryRequest, QueryError> {
    let unmarshal_error = |message: &str| {
        QueryError::malformed(RejectReason::FailedToUnmarshalRequest, message)
    };
    let body: QueryRequestBody =
        serde_json::from_slice(body).map_err(|_| unmarshal_error("invalid request body"))?;
    let bytes = decode_hex(&body.bytes).map_err(|_| unmarshal_error("invalid request bytes"))?;
    let signature =
        decode_hex(&body.signature).map_err(|_| unmarshal_error("invalid request signature"))?;
    Ok(SignedQueryRequest::new(bytes, signature))
}

fn decode_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(value.trim_start_matches("0x"))
}

fn error_reply(err: &QueryError) -> Response {
    warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            error: err.reason().to_string(),
        }),
        err.status_code(),
    )
    .into_response()
}
