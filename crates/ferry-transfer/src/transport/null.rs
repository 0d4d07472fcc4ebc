//! Transport without a tunnel

use crate::endpoint::Endpoint;

/// No tunnel, no side-cars: clients connect to the endpoint directly
#[derive(Clone, Debug, Default)]
pub struct NullTransport {
    port: Option<u16>,
}

impl NullTransport {
    /// Create a direct transport
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint port, once either side has been created
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub(crate) fn create_server(&mut self, endpoint: &Endpoint) {
        self.port = endpoint.port();
    }

    pub(crate) fn create_client(&mut self, endpoint: &Endpoint) {
        self.port = endpoint.port();
    }
}
