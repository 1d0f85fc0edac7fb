//! wiremock fixtures for driving the blocking HTTP clients from plain `#[test]`s.

use std::net::TcpListener;

use tokio::runtime::Runtime;
use wiremock::{Mock, MockServer, Request};

/// A mock server kept alive on its own tokio runtime.
///
/// The blocking `ureq` agents under test run on the test thread while the runtime's workers
/// answer them.
pub(crate) struct MockHttp {
    server: MockServer,
    rt: Runtime,
}

impl MockHttp {
    pub(crate) fn start() -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("tokio runtime");
        let server = rt.block_on(MockServer::start());
        Self { server, rt }
    }

    pub(crate) fn uri(&self) -> String {
        self.server.uri()
    }

    pub(crate) fn mount(&self, mock: Mock) {
        self.rt.block_on(mock.mount(&self.server));
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.rt
            .block_on(self.server.received_requests())
            .unwrap_or_default()
    }
}

/// An address nothing is listening on.
pub(crate) fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    drop(listener);
    format!("http://{addr}/track.mp3")
}
