// Outbound transport
//
// The engine ships batched JSON arrays through a backend owned by the
// embedding process. Two functionally equivalent input endpoint shapes
// exist; which one to prefer is negotiated once at startup, and a NotFound
// answer at runtime demotes the process to the legacy shape for the rest of
// its lifetime.

use std::future::Future;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint not found")]
    NotFound,

    #[error("transport failure: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Diagnostics,
    Input,
    LegacyInput,
}

/// The HTTP/queueing layer that actually moves bytes off-process.
/// Implementations live outside this crate.
pub trait TransportBackend {
    fn post(&self, endpoint: Endpoint, body: String)
        -> impl Future<Output = Result<(), TransportError>>;
}

pub struct Transport<B> {
    backend: B,
    use_legacy_input: bool,
}

impl<B: TransportBackend> Transport<B> {
    /// `prefer_legacy_input` reflects the capability negotiated at startup.
    pub fn new(backend: B, prefer_legacy_input: bool) -> Self {
        Transport { backend, use_legacy_input: prefer_legacy_input }
    }

    pub async fn send_diagnostics(&mut self, batch: String) -> Result<(), TransportError> {
        self.backend.post(Endpoint::Diagnostics, batch).await
    }

    /// Send a batch of snapshot payloads. Falls back to the legacy endpoint
    /// shape permanently the first time the preferred one answers NotFound.
    pub async fn send_input(&mut self, batch: String) -> Result<(), TransportError> {
        if !self.use_legacy_input {
            match self.backend.post(Endpoint::Input, batch.clone()).await {
                Err(TransportError::NotFound) => {
                    warn!("input endpoint not found, falling back to legacy endpoint");
                    self.use_legacy_input = true;
                }
                result => return result,
            }
        }
        debug!("sending input batch via legacy endpoint");
        self.backend.post(Endpoint::LegacyInput, batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingBackend {
        posts: RefCell<Vec<Endpoint>>,
        input_not_found: bool,
    }

    impl TransportBackend for RecordingBackend {
        async fn post(&self, endpoint: Endpoint, _body: String) -> Result<(), TransportError> {
            self.posts.borrow_mut().push(endpoint);
            if endpoint == Endpoint::Input && self.input_not_found {
                Err(TransportError::NotFound)
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_prefers_input_endpoint() {
        let backend = RecordingBackend { posts: RefCell::new(Vec::new()), input_not_found: false };
        let mut transport = Transport::new(backend, false);

        transport.send_input("[]".to_string()).await.unwrap();
        assert_eq!(transport.backend.posts.borrow().as_slice(), &[Endpoint::Input]);
    }

    #[tokio::test]
    async fn test_not_found_falls_back_permanently() {
        let backend = RecordingBackend { posts: RefCell::new(Vec::new()), input_not_found: true };
        let mut transport = Transport::new(backend, false);

        transport.send_input("[]".to_string()).await.unwrap();
        transport.send_input("[]".to_string()).await.unwrap();

        // The preferred shape is only tried once.
        assert_eq!(
            transport.backend.posts.borrow().as_slice(),
            &[Endpoint::Input, Endpoint::LegacyInput, Endpoint::LegacyInput]
        );
    }

    #[tokio::test]
    async fn test_negotiated_legacy_preference() {
        let backend = RecordingBackend { posts: RefCell::new(Vec::new()), input_not_found: false };
        let mut transport = Transport::new(backend, true);

        transport.send_input("[]".to_string()).await.unwrap();
        assert_eq!(transport.backend.posts.borrow().as_slice(), &[Endpoint::LegacyInput]);
    }
}
