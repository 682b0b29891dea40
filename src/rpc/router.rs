use super::jsonrpc::{
    RpcError, RpcRequest, RpcResponse, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use super::methods::{MethodParseError, RpcMethod};
use crate::api::PlumberService;
use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Routes JSON-RPC requests to [`PlumberService`] operations
#[derive(Debug, Clone)]
pub struct RpcRouter {
    service: Arc<PlumberService>,
}

impl RpcRouter {
    pub fn new(service: Arc<PlumberService>) -> Self {
        Self { service }
    }

    /// Handle a raw request body, answering `-32700` when it is not JSON
    pub async fn handle_raw(&self, body: &str) -> RpcResponse {
        let value: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                return RpcResponse::failure(
                    Value::Null,
                    RpcError::new(PARSE_ERROR, format!("Parse error: {e}")),
                )
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<RpcRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(e) => RpcResponse::failure(
                id,
                RpcError::new(INVALID_REQUEST, format!("Invalid request: {e}")),
            ),
        }
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest {
            jsonrpc,
            method,
            params,
            id,
        } = request;

        if jsonrpc != JSONRPC_VERSION {
            return RpcResponse::failure(
                id,
                RpcError::new(
                    INVALID_REQUEST,
                    format!("Invalid request: unsupported jsonrpc version {jsonrpc:?}"),
                ),
            );
        }

        let call = match RpcMethod::parse(&method, params) {
            Ok(call) => call,
            Err(e) => {
                let code = match &e {
                    MethodParseError::UnknownMethod(_) => METHOD_NOT_FOUND,
                    MethodParseError::InvalidParams { .. } => INVALID_PARAMS,
                };
                warn!(method = %method, error = %e, "Rejected RPC request");
                return RpcResponse::failure(id, RpcError::new(code, e.to_string()));
            }
        };

        let started = Instant::now();
        let result = self.dispatch(call).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                debug!(method = %method, elapsed_ms, "RPC call succeeded");
                RpcResponse::success(id, value)
            }
            Err(e) => {
                warn!(method = %method, elapsed_ms, error = %e, "RPC call failed");
                RpcResponse::failure(id, RpcError::from(&e))
            }
        }
    }

    /// Execute an already-parsed call
    pub async fn dispatch(&self, call: RpcMethod) -> Result<Value> {
        let service = &self.service;
        match call {
            RpcMethod::AgentRegister(p) => to_value(service.register_agent(p).await?),
            RpcMethod::AgentHeartbeat(p) => to_value(service.heartbeat(&p.agent_id).await?),
            RpcMethod::AgentPollTask(p) => to_value(service.poll_task(&p.agent_id).await?),
            RpcMethod::StepReport(p) => to_value(service.report_step(p).await?),
            RpcMethod::AgentCreate(p) => to_value(service.create_agent(p).await?),
            RpcMethod::AgentList => to_value(service.list_agents().await?),
            RpcMethod::AgentGet(p) => to_value(service.get_agent(&p.agent_id).await?),
            RpcMethod::AgentUpdate(p) => to_value(service.update_agent(p).await?),
            RpcMethod::AgentDelete(p) => to_value(service.delete_agent(&p.agent_id).await?),
            RpcMethod::AgentGetConfig(p) => {
                to_value(service.get_agent_config(&p.agent_id).await?)
            }
            RpcMethod::TaskCreate(p) => to_value(service.create_task(p).await?),
            RpcMethod::TaskGet(p) => to_value(service.get_task(&p.task_id).await?),
            RpcMethod::TaskList => to_value(service.list_tasks().await?),
            RpcMethod::TaskUpdate(p) => to_value(service.update_task(p).await?),
            RpcMethod::TaskDelete(p) => to_value(service.delete_task(&p.task_id).await?),
            RpcMethod::TaskRun(p) => to_value(service.run_task(&p.task_id).await?),
            RpcMethod::ExecutionGet(p) => {
                to_value(service.get_execution(&p.execution_id).await?)
            }
            RpcMethod::ExecutionList(p) => to_value(service.list_executions(p).await?),
        }
    }
}
