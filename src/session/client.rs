//! Client session: drives one endpoint's control-channel exchange against a
//! server and then performs its own endpoint's RDMA action.
//!
//! Grounded on `doca-cpp`'s client-side coroutine (`RdmaClient::RequestEndpointProcessing`
//! / `HandleClientSession`), generalised since the original leaves the actual
//! submission an unimplemented stub. Each side registers an endpoint naming its
//! *own* role (a client's `send` endpoint is answered by a server's `receive`
//! endpoint on the same path); the request names the peer's side of that pair,
//! so the wire carries `endpoint.op().peer_op()` rather than the client's own op.
//! Unlike the server session, the client never calls the endpoint's handler —
//! that hook exists for the server's reactive role; the client is the one
//! driving the request and is expected to have its buffer ready beforehand.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, ToSocketAddrs};

use crate::endpoint::{Endpoint, OpKind};
use crate::error::{RdmaError, Result};
use crate::executor::{Executor, Operation};
use crate::protocol::{AckCode, Acknowledge, Request, Response, ResponseCode};
use crate::rdma::buffer::RdmaBuffer;

#[derive(Clone, Copy, Debug)]
pub struct ClientTimeouts {
    pub response: Duration,
    pub connect: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        ClientTimeouts { response: Duration::from_millis(5000), connect: Duration::from_millis(5000) }
    }
}

/// Connects to `control_addr`, requests processing of `endpoint`, performs the
/// RDMA transfer, and reports the outcome back over the same socket.
pub async fn request_endpoint_processing(
    endpoint: &Endpoint,
    control_addr: impl ToSocketAddrs,
    executor: &Arc<Executor>,
    timeouts: ClientTimeouts,
) -> Result<()> {
    // Fails fast rather than waiting out `timeouts.connect`: a request issued
    // before `Executor::connect` has ever been called is a caller ordering
    // mistake. A connect that's merely still in flight is not — that case
    // still gets the full `timeouts.connect` window below.
    if !executor.connect_attempted() {
        return Err(RdmaError::state("no active connection: connect before requesting endpoint processing"));
    }

    let mut socket = TcpStream::connect(control_addr).await?;

    let connection_id = executor.wait_for_active_connection(timeouts.connect)?;

    let request =
        Request { op: endpoint.op().peer_op(), path: endpoint.path().to_owned(), connection_id: connection_id.0 };
    request.write(&mut socket).await?;

    let response = match tokio::time::timeout(timeouts.response, Response::read(&mut socket)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(RdmaError::Timeout(timeouts.response)),
    };

    if response.code != ResponseCode::Permitted {
        return Err(rejection_error(endpoint, response.code));
    }

    let outcome = perform_client_rdma(executor, endpoint, &response).await;

    let ack = match &outcome {
        Ok(()) => Acknowledge::new(AckCode::Completed),
        Err(_) => Acknowledge::new(AckCode::Failed),
    };
    ack.write(&mut socket).await?;
    outcome
}

fn rejection_error(endpoint: &Endpoint, code: ResponseCode) -> RdmaError {
    match code {
        ResponseCode::EndpointNotFound => RdmaError::registry(format!("server has no endpoint for {}", endpoint.id())),
        ResponseCode::EndpointLocked => RdmaError::state(format!("endpoint {} is locked by another session", endpoint.id())),
        ResponseCode::ServiceError => RdmaError::Service { endpoint: endpoint.id().clone(), message: "server handler failed".into() },
        ResponseCode::InternalError => RdmaError::connection("server reported an internal error"),
        ResponseCode::Rejected | ResponseCode::Permitted => RdmaError::connection("request was rejected"),
    }
}

async fn perform_client_rdma(executor: &Arc<Executor>, endpoint: &Endpoint, response: &Response) -> Result<()> {
    let local = endpoint.ensure_mapped().map(|_| endpoint.buffer_arc())?;

    // The client submits its own endpoint's literal op — it is the one that
    // actually sends, receives, reads or writes; `peer_op` only ever decided
    // what to ask the server to do.
    let op = match endpoint.op() {
        OpKind::Send => Operation::Send(local),
        OpKind::Receive => Operation::Receive(local),
        OpKind::Write => Operation::Write { local, remote: Arc::new(remote_buffer(endpoint, response)?) },
        OpKind::Read => Operation::Read { local, remote: Arc::new(remote_buffer(endpoint, response)?) },
    };

    let executor = executor.clone();
    tokio::task::spawn_blocking(move || executor.submit(op))
        .await
        .map_err(|e| RdmaError::state(format!("executor submission task panicked: {e}")))?
}

fn remote_buffer(endpoint: &Endpoint, response: &Response) -> Result<RdmaBuffer> {
    if response.descriptor.is_empty() {
        return Err(RdmaError::protocol("response carried no descriptor for a read/write endpoint"));
    }
    RdmaBuffer::remote(endpoint.buffer().device().clone(), response.descriptor.clone())
}
