#![forbid(unsafe_code)]
//! Demo node: builds a skipchain with a local roster, streams the blocks as
//! they are appended and pages through the resulting history.

use clap::Parser;
use skipchain::blockchain::Roster;
use skipchain::config::{load_config, load_config_from};
use skipchain::crypto::LocalSigner;
use skipchain::pagination::PaginateRequest;
use skipchain::service::Service;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./skipchain.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of roster members signing the chain
    #[arg(long, default_value_t = 4)]
    members: usize,
    /// Number of blocks to append after genesis
    #[arg(long, default_value_t = 20)]
    blocks: u64,
    /// Blocks per page when reading the history back
    #[arg(long, default_value_t = 5)]
    page_size: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt::init();

    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    info!(
        base_height = config.chain.base_height,
        maximum_height = config.chain.maximum_height,
        "Starting skipchain node"
    );

    let signer = LocalSigner::generate(cli.members.max(1));
    let roster = Roster::from_keys(signer.keys());
    let service = Service::new(config, Arc::new(signer))?;

    let genesis = service.create_chain(roster.clone(), b"genesis".to_vec())?;
    let chain_id = genesis.hash;
    info!(chain = %hex::encode(chain_id), "Genesis stored");

    let (mut listener, cancel) = service.stream_blocks(chain_id)?;
    let expected = cli.blocks;
    let watcher = tokio::spawn(async move {
        let mut seen = 0u64;
        while seen < expected {
            match listener.recv().await {
                Some(response) => {
                    seen += 1;
                    info!(
                        index = response.block.index,
                        height = response.block.height,
                        "Streamed block {}",
                        hex::encode(response.block.hash)
                    );
                }
                None => break,
            }
        }
        seen
    });

    let mut last = genesis;
    for i in 0..cli.blocks {
        last = service
            .append_block(&chain_id, roster.clone(), format!("block {}", i + 1).into_bytes())
            .await?;
    }
    let streamed = watcher.await?;
    cancel.cancel();
    info!(streamed, "Streaming finished");

    service.verify_block(&last.hash)?;
    info!(index = last.index, "Latest block verified back to genesis");

    let total = cli.blocks + 1;
    let page_size = cli.page_size.max(1);
    let num_pages = (total / page_size).max(1);
    let request = PaginateRequest::new(chain_id, page_size, num_pages);
    let session = service.paginate_blocks(request)?;
    for _ in 0..num_pages {
        match session.responses.recv().await {
            Some(response) => match &response.result {
                Ok(blocks) => info!(
                    page = response.page_number,
                    first = blocks.first().map_or(0, |b| b.index),
                    last = blocks.last().map_or(0, |b| b.index),
                    "Received page"
                ),
                Err(e) => {
                    warn!(code = e.code(), "Pagination failed: {}", e);
                    break;
                }
            },
            None => break,
        }
    }
    session.cancel.cancel();

    service.close().await;
    Ok(())
}
