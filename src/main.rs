use clap::Parser;
use imingest::cli::SubCommandExtend;
use imingest::config::{Opts, SubCommand};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let opts = Opts::parse();
    match &opts.subcmd {
        SubCommand::Ingest(cmd) => cmd.run(&opts).await,
        SubCommand::Server(cmd) => cmd.run(&opts).await,
        SubCommand::Clean(cmd) => cmd.run(&opts).await,
    }
}
