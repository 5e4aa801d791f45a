use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use imgsquash::{slug::make_slug, util::init_logging};

/// Create a slug: <tgz file> with <tar file> as "diff.tar" and <metadata conf> as "METADATA/conf"
#[derive(Debug, Parser)]
#[clap(name = "make-slug", version)]
pub struct App {
    /// Only report warnings and errors
    #[clap(long, short)]
    quiet: bool,

    /// The squashed filesystem archive
    tar_file: PathBuf,
    /// The slug configuration (JSON)
    metadata_conf: PathBuf,
    /// The slug to create
    tgz_file: PathBuf,
}

fn main() -> Result<()> {
    let args = App::parse();
    init_logging(args.quiet);

    make_slug(&args.tar_file, &args.metadata_conf, &args.tgz_file)
}
