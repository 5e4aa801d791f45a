use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use imgsquash::{
    export::{export_image, ExportOptions},
    tool::DockerCli,
    util::init_logging,
};

/// Export the filesystem of a container image as a single tar file
#[derive(Debug, Parser)]
#[clap(name = "image-export", version)]
pub struct App {
    /// Only report warnings and errors
    #[clap(long, short)]
    quiet: bool,
    /// Only export the layers the image adds on top of this base image
    #[clap(long)]
    from: Option<String>,
    /// Use an extracted `docker save` of the image instead of saving it again
    #[clap(long)]
    save_dir: Option<PathBuf>,
    /// Only export this many of the newest layers (0 for no limit); takes precedence over --from
    #[clap(long, default_value_t = 0)]
    layer_count: usize,
    /// The program used to save and inspect images
    #[clap(long, default_value = "docker")]
    docker: String,

    image: String,
    /// The tar file to create
    output: PathBuf,
}

fn main() -> Result<()> {
    let args = App::parse();
    init_logging(args.quiet);

    let options = ExportOptions {
        base_image: args.from,
        save_dir: args.save_dir,
        layer_count: (args.layer_count > 0).then_some(args.layer_count),
        progress: !args.quiet,
    };
    let report = export_image(&DockerCli::new(args.docker), &args.image, &args.output, &options)?;

    log::info!(
        "{}: {} entries from {} layers, {} masked, {} duplicates",
        args.output.display(),
        report.stats.written,
        report.layers,
        report.stats.masked,
        report.stats.duplicates
    );
    println!("sha256:{}", hex::encode(report.sha256));
    Ok(())
}
