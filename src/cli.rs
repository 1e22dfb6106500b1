use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crawlsite", about = "Bounded single-origin website analysis engine")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crawl a site starting from one seed URL and wait for the result
    Analyze {
        /// Seed URL to crawl
        #[arg(long)]
        seed: String,

        /// Caller-supplied application id this run belongs to
        #[arg(long)]
        application_id: Option<uuid::Uuid>,

        /// Override max_crawl_depth from the config file
        #[arg(long)]
        max_depth: Option<u32>,

        /// Override max_pages_to_crawl from the config file
        #[arg(long)]
        max_pages: Option<usize>,
    },
    /// Print the persisted summary and counters for a run
    Status {
        /// Run id returned by a previous `analyze`
        run_id: uuid::Uuid,
    },
    /// Print the hierarchical source read for one page in a run
    Source {
        /// Run id returned by a previous `analyze`
        run_id: uuid::Uuid,

        /// Page URL to read
        url: String,
    },
    /// Delete a run and all its persisted data
    Delete {
        /// Run id to delete
        run_id: uuid::Uuid,
    },
}
