#[tokio::main]
async fn main() -> anyhow::Result<()> {
  huddle::run().await
}
