//! Connects to a local server, sets a key, and reads it back, using only
//! the blocking context.
use std::time::Duration;

use log::LevelFilter;
use resp_client::{ConnectOptions, FormatArg, SyncContext};
use simple_logger::SimpleLogger;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;

    let opts = ConnectOptions {
        timeout: Some(Duration::from_secs(1)),
        reuse_addr: false,
    };
    let mut ctx = SyncContext::connect_tcp("127.0.0.1:6379", opts)?;

    let reply = ctx.command("SET %s %s", &[FormatArg::Str("greeting"), FormatArg::Str("hello")])?;
    println!("SET -> {reply:?}");

    let reply = ctx.command_argv(&[b"GET", b"greeting"])?;
    println!("GET -> {reply:?}");

    Ok(())
}
