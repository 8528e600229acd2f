#[tokio::main]
async fn main() -> eyre::Result<()> {
    nudgeq::run().await
}
