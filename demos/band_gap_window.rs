use anyhow::Result;
use aflow::filter::{in_set, range};
use aflow::{Client, Direction};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Example program that calls the library API.
    // Configure the endpoint via env vars or a `.aflowrc` file; set RUST_LOG=aflow=debug
    // to watch pages being fetched.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = Client::from_env()?;

    let filter = range("band_gap", 1.0, 3.0)? & in_set("species", ["Ga", "In"])?;
    let records = client
        .query()
        .filter(filter)
        .select(["auid", "aurl", "compound", "band_gap", "species"])?
        .order_by("band_gap", Direction::Ascending)?
        .page_size(50)
        .fetch()?;

    for record in records.take(20) {
        let record = record?;
        println!(
            "{:<24} {:>6}",
            record.string("compound").unwrap_or("?"),
            record
                .number("band_gap")
                .map(|g| format!("{:.3}", g))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}
