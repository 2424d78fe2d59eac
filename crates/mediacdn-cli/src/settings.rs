use std::path::PathBuf;

use clap::Parser;
use reqwest::Url;
use tracing_subscriber::EnvFilter;

/// The default edge node address.
pub const DEFAULT_URL: &str = "http://127.0.0.1:8080/";

/// Browse and download files from a mediacdn edge node.
///
/// Lists the available series, then the types of the chosen series, then the files of the chosen
/// type, and downloads the chosen file.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
pub struct Cli {
    /// Base URL of the edge node.
    #[arg(long, default_value = DEFAULT_URL)]
    pub url: Url,

    /// Directory to save downloaded files in.
    #[arg(long, short, default_value = "downloads")]
    pub output: PathBuf,

    /// Log verbosity, written to stderr.
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

impl Cli {
    /// The log filter, preferring `RUST_LOG` if it is set.
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}
