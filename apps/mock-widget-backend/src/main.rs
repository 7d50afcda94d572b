use anyhow::{Context, Result};
use sbw_mock_backend::{DEFAULT_ADDR, MockBackend, serve};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    sbw_telemetry::install("sbw-mock-backend")?;
    let addr = std::env::var("SBW_MOCK_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    serve(listener, MockBackend::new()).await
}
