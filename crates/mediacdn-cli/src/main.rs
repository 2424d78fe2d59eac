//! An interactive client for a mediacdn edge node.
//!
//! Walks through the catalog one level at a time (series, type, file) and downloads the chosen
//! file into a local directory.

use clap::Parser;
use console::Term;

use client::CdnClient;
use prompt::Selection;
use settings::Cli;

mod client;
mod prompt;
mod settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_writer(std::io::stderr)
        .init();

    let client = CdnClient::new(cli.url.clone())?;
    let term = Term::stdout();
    run(&client, &term, &cli).await
}

async fn run(client: &CdnClient, term: &Term, cli: &Cli) -> anyhow::Result<()> {
    let series = match client.list_series().await {
        Ok(series) => series,
        Err(err) => {
            term.write_line(&format!("Failed to fetch series list: {err:#}"))?;
            return Ok(());
        }
    };
    let Some(series) = choose(term, "series", &series)? else {
        return Ok(());
    };

    let types = match client.list_types(&series).await {
        Ok(types) => types,
        Err(err) => {
            term.write_line(&format!("Failed to fetch types list: {err:#}"))?;
            return Ok(());
        }
    };
    let Some(ty) = choose(term, "type", &types)? else {
        return Ok(());
    };

    let files = match client.list_files(&series, &ty).await {
        Ok(files) => files,
        Err(err) => {
            term.write_line(&format!("Failed to fetch file list: {err:#}"))?;
            return Ok(());
        }
    };
    let Some(filename) = choose(term, "file", &files)? else {
        return Ok(());
    };

    match client.download(&series, &ty, &filename, &cli.output).await {
        Ok(path) => {
            term.write_line(&format!("File fetched successfully: {filename}"))?;
            term.write_line(&format!("File saved locally in {}", path.display()))?;
        }
        Err(err) => term.write_line(&format!("Failed to fetch file: {err:#}"))?,
    }
    Ok(())
}

/// Lists `items` and asks for one of them.
///
/// Returns `None` when there is nothing to choose from or the answer is not a valid choice.
fn choose(term: &Term, what: &str, items: &[String]) -> std::io::Result<Option<String>> {
    if items.is_empty() {
        term.write_line(&format!("No {what} available."))?;
        return Ok(None);
    }

    match prompt::select(term, what, items)? {
        Selection::Chosen(index) => Ok(items.get(index).cloned()),
        Selection::Invalid => {
            term.write_line("Invalid selection.")?;
            Ok(None)
        }
    }
}
