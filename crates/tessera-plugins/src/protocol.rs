//! Line-delimited JSON protocol spoken by process-backed workers.
//!
//! Each message is one JSON object per line. The host writes requests to
//! the worker's stdin and reads responses from its stdout:
//!
//! ```text
//! -> {"id":1,"contract":1,"method":"setSettings","params":{"incrementBy":2}}
//! <- {"id":1,"result":null}
//! -> {"id":2,"contract":1,"method":"explode","params":null}
//! <- {"id":2,"error":{"code":"unsupported_operation","message":"explode"}}
//! ```
//!
//! Workers log to stderr; stdout lines that are not responses are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::RpcError;
use crate::worker::{self, CONTRACT_VERSION, WorkerModule};

/// Wire code sent when a request targets a different contract version
pub const CONTRACT_MISMATCH: &str = "contract_mismatch";

fn default_contract() -> u32 {
    CONTRACT_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(default = "default_contract")]
    pub contract: u32,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            contract: CONTRACT_VERSION,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: WireError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Convert into the caller-facing result. A response carrying neither
    /// field, or `"result": null`, is a successful null.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl From<&RpcError> for WireError {
    fn from(error: &RpcError) -> Self {
        let message = match error {
            RpcError::UnsupportedOperation(operation) => operation.clone(),
            RpcError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            code: error.wire_code().to_string(),
            message,
        }
    }
}

impl From<WireError> for RpcError {
    fn from(error: WireError) -> Self {
        match error.code.as_str() {
            "unsupported_operation" => RpcError::UnsupportedOperation(error.message),
            _ => RpcError::Remote {
                code: error.code,
                message: error.message,
            },
        }
    }
}

/// Write one message followed by a newline, then flush
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Answer requests read from `input` until it reaches end of file
pub async fn serve<R, W>(
    mut module: Box<dyn WorkerModule>,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request line");
                continue;
            }
        };

        debug!(id = request.id, method = %request.method, "Handling request");

        let response = if request.contract != CONTRACT_VERSION {
            Response::failure(
                request.id,
                WireError {
                    code: CONTRACT_MISMATCH.to_string(),
                    message: format!(
                        "worker speaks contract {CONTRACT_VERSION}, request used {}",
                        request.contract
                    ),
                },
            )
        } else {
            match worker::dispatch(module.as_mut(), &request.method, request.params).await {
                Ok(result) => Response::success(request.id, result),
                Err(e) => Response::failure(request.id, WireError::from(&e)),
            }
        };

        write_message(&mut output, &response).await?;
    }

    Ok(())
}

/// Serve a worker over this process's stdin and stdout
pub async fn serve_stdio(module: Box<dyn WorkerModule>) -> std::io::Result<()> {
    serve(
        module,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::CounterWorker;
    use serde_json::json;

    async fn exchange(requests: &[Value]) -> Vec<Response> {
        let mut input = String::new();
        for request in requests {
            input.push_str(&request.to_string());
            input.push('\n');
        }

        let mut output = Vec::new();
        serve(
            Box::new(CounterWorker::default()),
            BufReader::new(input.as_bytes()),
            &mut output,
        )
        .await
        .unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn request_defaults_contract_and_params() {
        let request: Request = serde_json::from_str(r#"{"id":4,"method":"initialize"}"#).unwrap();
        assert_eq!(request.contract, CONTRACT_VERSION);
        assert_eq!(request.params, Value::Null);
    }

    #[test]
    fn null_result_is_success() {
        let response: Response = serde_json::from_str(r#"{"id":1,"result":null}"#).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn unsupported_operation_survives_the_wire() {
        let wire = WireError::from(&RpcError::UnsupportedOperation("explode".into()));
        let json = serde_json::to_string(&Response::failure(9, wire)).unwrap();
        let response: Response = serde_json::from_str(&json).unwrap();

        match response.into_result() {
            Err(RpcError::UnsupportedOperation(name)) => assert_eq!(name, "explode"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn serve_answers_each_request_in_order() {
        let responses = exchange(&[
            json!({"id": 1, "method": "setSettings", "params": {"incrementBy": 5}}),
            json!({"id": 2, "method": "initialize"}),
            json!({"id": 3, "method": "incrementCounter"}),
            json!({"id": 4, "method": "getData"}),
        ])
        .await;

        let ids: Vec<u64> = responses.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        let data = responses[3].clone().into_result().unwrap();
        assert_eq!(data["count"], 5);
    }

    #[tokio::test]
    async fn serve_reports_unknown_methods_and_contract_mismatch() {
        let responses = exchange(&[
            json!({"id": 1, "method": "explode"}),
            json!({"id": 2, "contract": 99, "method": "getData"}),
        ])
        .await;

        assert_eq!(
            responses[0].error.as_ref().unwrap().code,
            "unsupported_operation"
        );
        assert_eq!(responses[1].error.as_ref().unwrap().code, CONTRACT_MISMATCH);
    }

    #[tokio::test]
    async fn serve_skips_garbage_lines() {
        let input = "not json\n\n{\"id\":7,\"method\":\"getData\"}\n";
        let mut output = Vec::new();
        serve(
            Box::new(CounterWorker::default()),
            BufReader::new(input.as_bytes()),
            &mut output,
        )
        .await
        .unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"id\":7"));
    }
}
