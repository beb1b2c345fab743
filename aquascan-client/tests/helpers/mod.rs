//! Shared fixtures for integration tests
//!
//! Each test builds the routes it needs and serves them from an in-process
//! axum server on an ephemeral local port.

#![allow(dead_code)]

use aquascan_client::Client;
use aquascan_common::{ClientConfig, Notification};
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Query strings seen by a mock route, in arrival order
pub type QueryLog = Arc<Mutex<Vec<HashMap<String, String>>>>;

/// Serve `router` on 127.0.0.1:0 and return the bound address
pub async fn spawn_service(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock service");
    let addr = listener.local_addr().expect("mock service address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock service");
    });
    addr
}

pub fn config_for(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        api_url: format!("http://{addr}"),
        poll_interval_ms: 50,
        ..Default::default()
    }
}

pub fn client_for(addr: SocketAddr) -> Client {
    Client::new(config_for(addr)).expect("build client")
}

/// An address nothing listens on
pub async fn dead_address() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind unused port");
    let addr = listener.local_addr().expect("unused port address");
    drop(listener);
    addr
}

/// Everything published so far
pub fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        seen.push(notification);
    }
    seen
}
