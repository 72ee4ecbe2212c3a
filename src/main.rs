#[tokio::main]
async fn main() {
    courier::boot::boot().await;
}
