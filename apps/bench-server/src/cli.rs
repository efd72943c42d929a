use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bench-server",
    version,
    about = "Benchmark-results ingestion and timeline-aggregation server"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 33333)]
    pub port: u16,
}
