use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(name = "table-reader", about)]
pub struct Cli {
    /// Where to load TableReaderConfig from.
    #[arg(long, value_enum, default_value_t = ConfigSource::File)]
    pub config: ConfigSource,

    /// Tokio worker threads.
    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum ConfigSource {
    File,
    Env,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}
