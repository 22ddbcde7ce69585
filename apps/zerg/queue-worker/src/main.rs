//! Queue Worker Service - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_queue_worker::run().await
}
