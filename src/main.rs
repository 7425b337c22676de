#[tokio::main]
async fn main() -> anyhow::Result<()> {
    portkeeper_lib::run().await
}
