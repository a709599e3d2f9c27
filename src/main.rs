#[tokio::main]
async fn main() -> anyhow::Result<()> {
    speedchat::run().await
}
