// crates.io
use clap::Parser;
// self
use ctm_eval::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = Args::parse();

	ctm_eval::run(args).await
}
