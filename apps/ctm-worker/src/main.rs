// crates.io
use clap::Parser;
// self
use ctm_worker::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = Args::parse();

	ctm_worker::run(args).await
}
