//! Seeds a coordinator with two startup nodes and issues a handful of
//! pipelined commands, letting the coordinator follow any `MOVED`/`ASK`
//! redirects the cluster returns.
use log::LevelFilter;
use resp_client::{Coordinator, FormatArg};
use simple_logger::SimpleLogger;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;

    let coordinator = Coordinator::new();
    coordinator.add_node("127.0.0.1:7000".parse()?).await?;
    coordinator.add_node("127.0.0.1:7001".parse()?).await?;

    for key in ["a", "b", "c"] {
        let reply = coordinator
            .command("GET %s", &[FormatArg::Str(key)])
            .await?;
        println!("GET {key} -> {reply:?}");
    }

    Ok(())
}
