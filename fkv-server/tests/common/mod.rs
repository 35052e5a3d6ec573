//! Shared harness: run a real server on an ephemeral port in a background
//! runtime thread, shut it down when the test ends.

// Not every suite uses every helper.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use fkv_client::{ClientConfig, KVClient};
use fkv_server::{Server, ServerConfig};

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> TestServer {
        let (addr_tx, addr_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let server = Server::bind(ServerConfig::ephemeral())
                    .await
                    .expect("bind ephemeral");
                addr_tx
                    .send(server.local_addr().expect("local addr"))
                    .expect("report addr");
                server.run(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("serve");
            });
        });

        let addr = addr_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server did not start");
        TestServer {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    pub fn client(&self) -> KVClient {
        let config = ClientConfig {
            addr: format!("127.0.0.1:{}", self.addr.port()),
            read_timeout: Some(Duration::from_secs(5)),
            write_timeout: Some(Duration::from_secs(5)),
            connect_timeout: Some(Duration::from_secs(5)),
            ..ClientConfig::default()
        };
        KVClient::with_config(config).expect("client")
    }

    /// A client pinned to one pooled connection, for per-connection state
    /// such as CLIENT SETNAME.
    pub fn single_connection_client(&self) -> KVClient {
        let config = ClientConfig {
            addr: format!("127.0.0.1:{}", self.addr.port()),
            max_idle: 1,
            max_total: 1,
            read_timeout: Some(Duration::from_secs(5)),
            write_timeout: Some(Duration::from_secs(5)),
            connect_timeout: Some(Duration::from_secs(5)),
            ..ClientConfig::default()
        };
        KVClient::with_config(config).expect("client")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
