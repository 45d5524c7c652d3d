#[tokio::main]
async fn main() -> anyhow::Result<()> {
    food_order_lib::run().await
}
