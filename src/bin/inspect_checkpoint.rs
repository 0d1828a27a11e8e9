//! チェックポイントのメタデータ表示

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use fingerprint_pattern_lib::model::{load_metadata, print_metadata_info};

#[derive(Parser, Debug)]
#[command(name = "inspect_checkpoint", about = "Print checkpoint metadata")]
struct Args {
    /// チェックポイント (.tar.gz)
    checkpoints: Vec<PathBuf>,

    /// JSON で出力
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.checkpoints.is_empty() {
        anyhow::bail!("no checkpoint given");
    }

    for path in &args.checkpoints {
        let metadata = load_metadata(path).with_context(|| format!("failed to read {}", path.display()))?;
        if args.json {
            println!("{}", metadata.to_json_string()?);
        } else {
            println!("{}", path.display());
            print_metadata_info(&metadata);
        }
    }
    Ok(())
}
