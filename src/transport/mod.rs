//! gRPC transport.
//!
//! A single unary `Call` carries the method name and JSON parameters. The
//! engines are synchronous, so each call runs on the blocking pool.

use std::sync::Arc;

use serde_json::Value;
use tonic::{Request, Response, Status};

use crate::error::{MonitorError, ValidationError};
use crate::rpc::MonitorServices;

pub mod proto {
    tonic::include_proto!("cgmon");
}

use proto::monitor_service_server::{MonitorService, MonitorServiceServer};

/// Maximum size of a parameters payload.
const MAX_PARAMS_JSON_BYTES: usize = 1024 * 1024; // 1 MiB

/// Maximum size of a result payload.
const MAX_RESULT_JSON_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

const MAX_METHOD_LEN: usize = 128;

/// gRPC front of a [`MonitorServices`] node.
pub struct MonitorServiceImpl {
    services: Arc<MonitorServices>,
}

impl MonitorServiceImpl {
    #[must_use]
    pub const fn new(services: Arc<MonitorServices>) -> Self {
        Self { services }
    }

    #[must_use]
    pub fn into_server(self) -> MonitorServiceServer<Self> {
        MonitorServiceServer::new(self)
    }
}

/// Maps the error taxonomy onto status codes. The message keeps the
/// error's display form so callers can match on `NOT_FOUND` and friends.
#[must_use]
pub fn status_from_monitor_error(err: MonitorError) -> Status {
    let msg = err.to_string();
    match err {
        MonitorError::NotFound => Status::not_found(msg),
        MonitorError::MandatoryIeMissing { .. } | MonitorError::Validation(_) => Status::invalid_argument(msg),
        MonitorError::ResourceUnavailable => Status::resource_exhausted(msg),
        MonitorError::PartiallyExecuted { .. } => Status::aborted(msg),
        MonitorError::ServerError { .. } | MonitorError::Storage(_) | MonitorError::Internal { .. } => {
            Status::internal(msg)
        }
    }
}

fn parse_params(bytes: &[u8]) -> Result<Value, Status> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    if bytes.len() > MAX_PARAMS_JSON_BYTES {
        return Err(Status::invalid_argument("params_json exceeds maximum size"));
    }
    serde_json::from_slice(bytes).map_err(|e| Status::invalid_argument(format!("invalid params JSON: {e}")))
}

fn encode_result(value: &Value) -> Result<Vec<u8>, Status> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to serialize result JSON: {e}")))?;
    if bytes.len() > MAX_RESULT_JSON_BYTES {
        return Err(Status::resource_exhausted("serialized JSON exceeds size limit"));
    }
    Ok(bytes)
}

#[tonic::async_trait]
impl MonitorService for MonitorServiceImpl {
    async fn call(&self, request: Request<proto::CallRequest>) -> Result<Response<proto::CallResponse>, Status> {
        let req = request.into_inner();
        if req.method.is_empty() || req.method.len() > MAX_METHOD_LEN {
            return Err(status_from_monitor_error(
                ValidationError::UnknownMethod { method: req.method }.into(),
            ));
        }
        let params = parse_params(&req.params_json)?;

        let services = Arc::clone(&self.services);
        let method = req.method;
        let result = tokio::task::spawn_blocking(move || services.call(&method, params))
            .await
            .map_err(|e| Status::internal(format!("call task failed: {e}")))?
            .map_err(status_from_monitor_error)?;

        let result_json = encode_result(&result)?;
        Ok(Response::new(proto::CallResponse { result_json }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::storage::InMemoryDb;
    use crate::thresholds::LogActionExecutor;
    use serde_json::json;
    use tonic::Code;

    fn make_service() -> MonitorServiceImpl {
        let mut cfg = MonitorConfig::default();
        cfg.resources.enabled = true;
        let services = MonitorServices::new(&cfg, Arc::new(InMemoryDb::new()), Arc::new(LogActionExecutor))
            .expect("services");
        MonitorServiceImpl::new(Arc::new(services))
    }

    fn request(method: &str, params: &Value) -> Request<proto::CallRequest> {
        Request::new(proto::CallRequest {
            method: method.to_string(),
            params_json: serde_json::to_vec(params).expect("encode"),
        })
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let svc = make_service();
        let resp = svc
            .call(request("ResourceSv1.Ping", &Value::Null))
            .await
            .expect("ping")
            .into_inner();
        let v: Value = serde_json::from_slice(&resp.result_json).expect("decode");
        assert_eq!(v, json!("Pong"));
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let svc = make_service();
        let not_found = svc
            .call(request("ResourceSv1.GetResource", &json!({"tenant": "cgrates.org", "id": "nope"})))
            .await
            .expect_err("missing resource");
        assert_eq!(not_found.code(), Code::NotFound);

        let missing = svc
            .call(request("ResourceSv1.GetResource", &json!({"tenant": "", "id": ""})))
            .await
            .expect_err("missing fields");
        assert_eq!(missing.code(), Code::InvalidArgument);
        assert!(missing.message().starts_with("MANDATORY_IE_MISSING"));

        let unknown = svc
            .call(request("Nope.Nope", &Value::Null))
            .await
            .expect_err("unknown method");
        assert_eq!(unknown.code(), Code::InvalidArgument);
    }

    #[test]
    fn unavailable_and_partial_codes() {
        assert_eq!(
            status_from_monitor_error(MonitorError::ResourceUnavailable).code(),
            Code::ResourceExhausted
        );
        assert_eq!(
            status_from_monitor_error(MonitorError::PartiallyExecuted { ids: vec![] }).code(),
            Code::Aborted
        );
    }

    #[test]
    fn oversized_params_rejected() {
        let big = vec![b' '; MAX_PARAMS_JSON_BYTES + 1];
        assert_eq!(parse_params(&big).unwrap_err().code(), Code::InvalidArgument);
    }
}
