mod backend;
mod cli;
mod templates;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cli::dispatch::run().await
}
