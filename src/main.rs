use anyhow::{bail, Context, Result};
use chiral_swarm::config::SwarmConfig;
use chiral_swarm::hash_queue::{HashCalculationQueue, ShareDigest, TreeSource};
use chiral_swarm::logging::init_tracing;
use chiral_swarm::thex::{HashTree, TigerHash, VerifyResult};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chiral-swarm")]
#[command(about = "Chiral Network - Tiger tree hashing and verification", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the tree root and SHA-1 URN of a file
    Hash {
        path: PathBuf,
        /// Leaf block size in bytes (defaults to the configured block size)
        #[arg(long)]
        block_size: Option<u64>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a file against a tree root, optionally block by block with a tree file
    Verify {
        path: PathBuf,
        /// Expected root, bare base32 or urn:tree:tiger/:<base32>
        #[arg(long)]
        root: String,
        #[arg(long)]
        block_size: Option<u64>,
        /// Serialized tree (as written by export-tree) for per-block results
        #[arg(long)]
        tree: Option<PathBuf>,
    },
    /// Write the serialized tree of a file
    ExportTree {
        path: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        block_size: Option<u64>,
    },
}

async fn digest(config: &SwarmConfig, path: &Path, block_size: u64) -> Result<ShareDigest> {
    let queue = HashCalculationQueue::new(config.hashing.clone());
    queue
        .compute_tree(TreeSource::File(path.to_path_buf()), block_size)
        .await
        .with_context(|| format!("failed to hash {}", path.display()))
}

/// Verify `path` block by block against a serialized tree; returns the bad ranges.
fn verify_blocks(path: &Path, tree: &HashTree) -> Result<Vec<(u64, u64)>> {
    let mut file = std::fs::File::open(path)?;
    let block_size = tree.block_size();
    let mut block = vec![0u8; block_size as usize];
    let mut offset = 0u64;
    let mut bad = Vec::new();
    while offset < tree.file_size() {
        let want = block_size.min(tree.file_size() - offset) as usize;
        file.read_exact(&mut block[..want])?;
        if tree.verify_range(offset, &block[..want]) != VerifyResult::Valid {
            bad.push((offset, offset + want as u64));
        }
        offset += want as u64;
    }
    Ok(bad)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_level);

    let config = match &args.config {
        Some(path) => SwarmConfig::load(path)?,
        None => SwarmConfig::default(),
    };

    match args.command {
        Command::Hash {
            path,
            block_size,
            json,
        } => {
            let block_size = block_size.unwrap_or(config.download.block_size);
            let digest = digest(&config, &path, block_size).await?;
            let root = digest.tree.root();
            if json {
                let out = serde_json::json!({
                    "path": path.display().to_string(),
                    "size": digest.size,
                    "blockSize": block_size,
                    "treeUrn": root.to_urn(),
                    "rootHex": hex::encode(root.0),
                    "sha1Urn": digest.sha1_urn,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("{}", root.to_urn());
                println!("{}", digest.sha1_urn);
                println!("size {} bytes, {} leaves", digest.size, digest.tree.leaf_count());
            }
        }
        Command::Verify {
            path,
            root,
            block_size,
            tree,
        } => {
            let expected: TigerHash = root
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid tree root: {}", root))?;
            let block_size = block_size.unwrap_or(config.download.block_size);

            if let Some(tree_path) = tree {
                let size = std::fs::metadata(&path)?.len();
                let bytes = std::fs::read(&tree_path)
                    .with_context(|| format!("failed to read {}", tree_path.display()))?;
                let tree = HashTree::deserialize(&bytes, size, block_size, expected)
                    .context("tree file does not match the root")?;
                let bad = verify_blocks(&path, &tree)?;
                for (start, end) in &bad {
                    warn!(start, end, "Block failed verification");
                    println!("bad {}..{}", start, end);
                }
                if !bad.is_empty() {
                    bail!("{} of {} blocks failed verification", bad.len(), tree.leaf_count());
                }
            } else {
                let digest = digest(&config, &path, block_size).await?;
                if digest.tree.root() != expected {
                    bail!(
                        "root mismatch: expected {}, got {}",
                        expected.to_urn(),
                        digest.tree.root().to_urn()
                    );
                }
            }
            info!(path = %path.display(), "File verified");
            println!("ok");
        }
        Command::ExportTree {
            path,
            out,
            block_size,
        } => {
            let block_size = block_size.unwrap_or(config.download.block_size);
            let digest = digest(&config, &path, block_size).await?;
            let bytes = digest.tree.serialize()?;
            std::fs::write(&out, &bytes)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("{}", digest.tree.root().to_urn());
        }
    }
    Ok(())
}
