// `main.rs` only declares modules and jumps into `server::run()`. The
// implementation lives in the `config`, `mqtt`, `ingest`, `store`,
// `handlers`, and `server` modules under `src/`, one per responsibility.
mod config;
mod handlers;
mod ingest;
mod mqtt;
mod server;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    server::run().await
}
