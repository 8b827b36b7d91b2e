use anyhow::Result;
use clap::Parser;
use log::info;

use wmtrain::TrainArgs;

fn main() -> Result<()> {
    wmtrain::logging::init_logger();

    let args = TrainArgs::parse();
    info!("Starting watermark optimization: run {}", args.run_name);

    let summary = wmtrain::train_from_args(args)?;

    info!("Watermark saved to {}", summary.checkpoint.display());
    Ok(())
}
