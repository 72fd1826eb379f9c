use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use switchyard::types::parse::parse_document;
use switchyard::{app, config, telemetry};

#[derive(Parser, Debug)]
#[command(about = "A route-programmable HTTP reverse proxy", long_about = None)]
struct Args {
	/// Configuration file (YAML)
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,

	/// Route document to watch
	#[arg(short, long, value_name = "file")]
	routes_file: Option<PathBuf>,

	/// Routes given directly on the command line
	#[arg(short, long, value_name = "routes")]
	inline_routes: Option<String>,

	/// Listen address, e.g. 0.0.0.0:9090
	#[arg(short, long, value_name = "addr")]
	address: Option<String>,

	/// Parse configuration and routes, then exit
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();

	let contents = match &args.config {
		Some(path) => std::fs::read_to_string(path)?,
		None => String::new(),
	};
	let mut config = config::parse_config(&contents)?;
	if let Some(f) = args.routes_file {
		config.routes_file = Some(f);
	}
	if let Some(routes) = args.inline_routes {
		config.inline_routes = Some(routes);
	}
	if let Some(addr) = args.address {
		config.address = addr.parse()?;
	}

	if args.validate_only {
		if let Some(doc) = &config.inline_routes {
			parse_document(doc)?;
		}
		if let Some(path) = &config.routes_file {
			parse_document(&std::fs::read_to_string(path)?)?;
		}
		println!("configuration ok");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.worker_threads(config.num_worker_threads)
		.enable_all()
		.build()?
		.block_on(app::run(Arc::new(config)))
}
