//! Server session: one coroutine per accepted TCP connection.
//!
//! The request names the op kind of the server's *own* endpoint (the client
//! already translated its own op through `peer_op` before sending), so lookup
//! and submission both use `req.op`/`ep.op()` directly, no further translation.
//! RDMA read/write are one-sided: the server only ever exports a descriptor and
//! waits for the client's acknowledge, never submitting an operation of its own
//! for those kinds.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::endpoint::{Endpoint, EndpointId, EndpointRegistry, OpKind};
use crate::error::{RdmaError, Result};
use crate::executor::{Executor, Operation};
use crate::protocol::{AckCode, Acknowledge, Request, Response, ResponseCode};

#[derive(Clone, Copy, Debug)]
pub struct SessionTimeouts {
    pub acknowledge: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        SessionTimeouts { acknowledge: Duration::from_millis(5000) }
    }
}

/// Serves one accepted connection until the peer closes the socket or a
/// protocol-level error ends it.
pub async fn serve_connection(
    mut socket: TcpStream,
    registry: Arc<EndpointRegistry>,
    executor: Arc<Executor>,
    timeouts: SessionTimeouts,
) -> Result<()> {
    loop {
        let request = match Request::read(&mut socket).await {
            Ok(req) => req,
            Err(RdmaError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        handle_request(&mut socket, &registry, &executor, &timeouts, request).await?;
    }
}

async fn handle_request(
    socket: &mut TcpStream,
    registry: &EndpointRegistry,
    executor: &Arc<Executor>,
    timeouts: &SessionTimeouts,
    request: Request,
) -> Result<()> {
    let id = EndpointId::new(request.path.clone(), request.op);
    let endpoint = match registry.get(&id) {
        Ok(ep) => ep,
        Err(_) => {
            Response::new(ResponseCode::EndpointNotFound).write(socket).await?;
            return Ok(());
        }
    };

    if !registry.try_lock(endpoint.path()) {
        Response::new(ResponseCode::EndpointLocked).write(socket).await?;
        return Ok(());
    }

    let result = run_locked_session(socket, executor, &endpoint, timeouts).await;
    registry.unlock(endpoint.path());
    result
}

async fn run_locked_session(
    socket: &mut TcpStream,
    executor: &Arc<Executor>,
    endpoint: &Endpoint,
    timeouts: &SessionTimeouts,
) -> Result<()> {
    if endpoint.op().handler_runs_before_transfer() {
        if let Err(e) = endpoint.invoke_handler() {
            log::warn!("endpoint {} handler failed before transfer: {e}", endpoint.id());
            Response::new(ResponseCode::ServiceError).write(socket).await?;
            return Ok(());
        }
    }

    let mut response = Response::new(ResponseCode::Permitted);
    if matches!(endpoint.op(), OpKind::Read | OpKind::Write) {
        let map = endpoint.ensure_mapped()?;
        response.descriptor = map.export_rdma()?;
    }
    response.write(socket).await?;

    if let Err(e) = perform_server_rdma(executor, endpoint).await {
        log::warn!("endpoint {} rdma submission failed: {e}", endpoint.id());
        return Ok(());
    }

    let ack = match tokio::time::timeout(timeouts.acknowledge, Acknowledge::read(socket)).await {
        Ok(Ok(ack)) => ack,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            log::warn!("endpoint {} timed out waiting for acknowledge", endpoint.id());
            return Ok(());
        }
    };

    if ack.code != AckCode::Completed {
        log::warn!("endpoint {} acknowledge was {:?}, not completed", endpoint.id(), ack.code);
        return Ok(());
    }

    if !endpoint.op().handler_runs_before_transfer() {
        if let Err(e) = endpoint.invoke_handler() {
            log::warn!("endpoint {} handler failed after transfer: {e}", endpoint.id());
        }
    }

    Ok(())
}

/// Submits the server's own half of a two-sided transfer. A no-op for
/// read/write: those are one-sided and the client drives them entirely against
/// the descriptor already sent in the Response.
async fn perform_server_rdma(executor: &Arc<Executor>, endpoint: &Endpoint) -> Result<()> {
    let op = match endpoint.op() {
        OpKind::Send => Operation::Send(endpoint.buffer_arc()),
        OpKind::Receive => Operation::Receive(endpoint.buffer_arc()),
        OpKind::Read | OpKind::Write => return Ok(()),
    };

    let executor = executor.clone();
    tokio::task::spawn_blocking(move || executor.submit(op))
        .await
        .map_err(|e| RdmaError::state(format!("executor submission task panicked: {e}")))?
}
