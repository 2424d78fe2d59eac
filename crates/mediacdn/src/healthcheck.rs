use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, ensure};

/// Probes `/healthcheck` of the node at `addr`, printing `OK` or `ERROR`.
pub fn healthcheck(addr: SocketAddr, timeout: Duration) -> anyhow::Result<()> {
    let result = probe(addr, timeout);
    println!("{}", if result.is_ok() { "OK" } else { "ERROR" });
    result
}

fn probe(addr: SocketAddr, timeout: Duration) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()?;

    let url = format!("http://{addr}/healthcheck");
    tracing::debug!(%url, "Probing node health");

    let response = client
        .get(&url)
        .send()
        .with_context(|| format!("failed to reach mediacdn at {addr}"))?;
    let status = response.status();
    ensure!(
        status.is_success(),
        "mediacdn at {addr} is unhealthy, status {status}"
    );
    Ok(())
}
