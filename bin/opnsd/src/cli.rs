use clap::Parser;
use clap::Subcommand;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Where we should store data
    #[arg(long, default_value = "./.opnsd")]
    pub data_dir: String,

    /// Base URL of the transaction feed and fetch service
    #[arg(long, default_value = "https://junglebus.gorillapool.io")]
    pub feed_url: String,

    /// The admission topic this node serves
    #[arg(long, default_value = "tm_OpNS")]
    pub topic: String,

    /// Concurrent network fetches while resolving ancestry
    #[arg(long, default_value_t = 10)]
    pub fetch_concurrency: usize,

    /// Turn debugging information on
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow the feed and persist pending transactions into the queue
    Subscribe {
        /// Feed subscription to follow
        #[arg(long)]
        subscription_id: String,

        /// Height to start from when no progress is recorded yet
        #[arg(long, default_value_t = 0)]
        from_height: u32,
    },
    /// Resolve pending transactions and their ancestry into the cache
    Download,
    /// Consume the pending queue through the admission engine
    Process,
    /// Walk admitted claims forward through the external spends index
    Spends,
}
