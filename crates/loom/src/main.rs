use clap::{Parser, Subcommand};
use loom_repo::car::read_car_file;
use loom_repo::sync::verify_repo;
use loom_repo::{CarReadOptions, Did, MemoryBlockStore, Repo, VerifyOptions};
use miette::{IntoDiagnostic, Result, miette};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and verify repository CAR archives")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the root and a summary of the blocks in a CAR file
    Inspect {
        /// Path to the CAR file
        car: PathBuf,

        /// Skip checking block bytes against their CIDs
        #[arg(long)]
        no_verify_cids: bool,
    },

    /// Verify a full repository export against a DID and its signing key
    Verify {
        /// Path to the CAR file
        car: PathBuf,

        /// DID that should own the repository
        #[arg(long)]
        did: String,

        /// `did:key` the commit should be signed with
        #[arg(short = 'k', long)]
        key: String,

        /// Accept exports with missing record blocks
        #[arg(long)]
        allow_missing_records: bool,
    },

    /// List record keys in a repository export
    Ls {
        /// Path to the CAR file
        car: PathBuf,

        /// Only list this collection
        #[arg(short = 'c', long)]
        collection: Option<String>,
    },
}

async fn inspect(car: PathBuf, verify_cids: bool) -> Result<()> {
    let options = CarReadOptions::new().verify_cids(verify_cids).build();
    let contents = read_car_file(&car, options).await?;

    match contents.root() {
        Some(root) => println!("root:   {}", root),
        None => println!("root:   (none)"),
    }
    println!("blocks: {}", contents.blocks.len());
    println!("bytes:  {}", contents.blocks.size_in_bytes());
    Ok(())
}

async fn verify(car: PathBuf, did: String, key: String, allow_missing_records: bool) -> Result<()> {
    let did = Did::new_owned(did)?;
    let bytes = tokio::fs::read(&car).await.into_diagnostic()?;
    let options = VerifyOptions::new()
        .ensure_leaves(!allow_missing_records)
        .build();
    let verified = verify_repo(bytes, &did, &key, options).await?;

    println!("commit: {} (rev {})", verified.commit.cid, verified.commit.rev);
    println!("records: {}", verified.creates.len());
    for (collection, records) in &verified.records {
        println!("  {:<40} {}", collection, records.len());
    }
    Ok(())
}

async fn ls(car: PathBuf, collection: Option<String>) -> Result<()> {
    let contents = read_car_file(&car, CarReadOptions::default()).await?;
    let root = contents
        .root()
        .ok_or_else(|| miette!("{} has no root commit", car.display()))?;
    let storage = Arc::new(MemoryBlockStore::from_blocks(contents.blocks));
    let repo = Repo::load(storage, Some(root)).await?;

    let collections = match collection {
        Some(c) => vec![c.into()],
        None => repo.get_collections().await?,
    };
    for collection in collections {
        for (rkey, cid) in repo.list_records(&collection).await? {
            println!("{}/{}\t{}", collection, rkey, cid);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(EnvFilter::from_env("LOOM_LOG"))
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().command {
        Command::Inspect { car, no_verify_cids } => inspect(car, !no_verify_cids).await,
        Command::Verify {
            car,
            did,
            key,
            allow_missing_records,
        } => verify(car, did, key, allow_missing_records).await,
        Command::Ls { car, collection } => ls(car, collection).await,
    }
}
