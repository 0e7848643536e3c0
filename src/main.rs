use bt_hidproxy::config::Config;
use bt_hidproxy::core;
use bt_hidproxy::logging::init;
use clap::Parser;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init(&config.loglevel);
    let core = core::Core::new(config);
    core.run().await?;
    Ok(())
}
