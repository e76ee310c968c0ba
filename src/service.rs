//! # Application service handlers
//!
//! The handler interface an endpoint invokes at the correct phase relative to its
//! RDMA transfer. Deliberately opaque to the core: this crate only calls `call`,
//! never inspects what it does. Grounded on `doca-cpp`'s `RdmaServiceInterface`,
//! simplified here to operate directly on the endpoint's pinned byte range rather
//! than a richer buffer object, since the session layer is what owns buffer
//! lifetime and locking.

use crate::error::Result;

/// An application-supplied handler bound to one endpoint.
///
/// Called with the endpoint's pinned byte range: before the transfer for
/// `send`/`read` endpoints (to populate it, since they're the transfer's
/// source), after a `completed` acknowledge for `receive`/`write` endpoints
/// (to consume it, since they're the transfer's sink).
pub trait Service: Send + Sync {
    fn call(&self, buffer: &mut [u8]) -> Result<()>;
}

/// Adapts a plain closure to [`Service`], for tests and small demo handlers.
pub struct FnService<F> {
    f: F,
}

impl<F> FnService<F>
where
    F: Fn(&mut [u8]) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> FnService<F> {
        FnService { f }
    }
}

impl<F> Service for FnService<F>
where
    F: Fn(&mut [u8]) -> Result<()> + Send + Sync,
{
    fn call(&self, buffer: &mut [u8]) -> Result<()> {
        (self.f)(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_service_invokes_closure_with_buffer() {
        let svc = FnService::new(|buf: &mut [u8]| {
            buf.fill(0x42);
            Ok(())
        });
        let mut bytes = vec![0u8; 4];
        svc.call(&mut bytes).unwrap();
        assert_eq!(bytes, vec![0x42; 4]);
    }
}
