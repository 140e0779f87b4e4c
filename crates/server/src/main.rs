// codehive-server: standalone entry point.

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    codehive_server::runtime::run()
        .await
        .context("codehive server terminated unexpectedly")
}
