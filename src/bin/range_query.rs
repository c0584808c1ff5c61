//! Range query over both tiers
//!
//! Usage:
//!   range_query <from YYYY-MM-DD> <to YYYY-MM-DD>
//!
//! Prints `{"data": {date: {type: {method: amount}}}}`; days with no data
//! in either tier are absent.

use dotenv::dotenv;
use ledgerflow::pipeline::{
    types::parse_day, DurableStore, HotStore, RangeMerger, SqliteDurableStore, SqliteHotStore, TieringConfig,
};
use serde_json::json;
use std::env;
use std::sync::Arc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <from YYYY-MM-DD> <to YYYY-MM-DD>", args[0]);
        std::process::exit(2);
    }
    let from = parse_day(&args[1])?;
    let to = parse_day(&args[2])?;

    let config = TieringConfig::from_env();
    let hot: Arc<dyn HotStore> = Arc::new(SqliteHotStore::open(&config.hot_db_path)?);
    let durable: Arc<dyn DurableStore> = Arc::new(SqliteDurableStore::open(&config.durable_db_path)?);

    let data = RangeMerger::new(hot, durable).range_query(from, to).await?;
    println!("{}", serde_json::to_string_pretty(&json!({ "data": data }))?);
    Ok(())
}
