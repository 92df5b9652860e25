//! layerdisk - convert a Nydus OCI image into a GPT disk image

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use layerdisk::{ConvertConfig, Converter, Error, LayerKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "layerdisk", version, about)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch an image and build a validated disk image from it
    Convert {
        #[command(flatten)]
        image: ImageArgs,

        /// Build one part file per added layer and link output.img to the last
        #[arg(long)]
        incremental: bool,
    },
    /// Only fetch the image layers into the target directory
    Download {
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Resolve the image and print its layers
    Inspect {
        /// Source image reference
        #[arg(long, env = "SOURCE")]
        source: String,

        /// Print the classified image as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ImageArgs {
    /// Source image reference (e.g. localhost:5000/ubuntu-nydus:latest)
    #[arg(long, env = "SOURCE")]
    source: String,

    /// Directory for fetched blobs and disk images; emptied on every run
    #[arg(long, env = "TARGET", default_value = "./workdir")]
    target: PathBuf,

    /// Maximum concurrent layer downloads
    #[arg(long, default_value_t = layerdisk::config::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Only use the first N layers, bootstrap included
    #[arg(long = "layers")]
    layers: Option<usize>,
}

impl ImageArgs {
    fn config(&self) -> ConvertConfig {
        let mut config = ConvertConfig::new()
            .source(self.source.clone())
            .target_dir(self.target.clone())
            .concurrency(self.concurrency);
        if let Some(n) = self.layers {
            config = config.layer_limit(n);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(cli.command).await {
        error!(phase = e.phase(), "{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Convert { image, incremental } => {
            let config = image.config().incremental(incremental);
            let report = Converter::from_registry(config)?.convert().await?;
            for part in &report.parts {
                info!(part = %part.display(), "part image");
            }
            println!("{}", report.output.display());
        }
        Command::Download { image } => {
            let converter = Converter::from_registry(image.config())?;
            let (_, blobs) = converter.download().await?;
            for blob in &blobs {
                println!("{}", blob.local_path.display());
            }
        }
        Command::Inspect { source, json } => {
            let converter = Converter::from_registry(ConvertConfig::new().source(source))?;
            let image = converter.inspect().await?;
            if json {
                let out = serde_json::to_string_pretty(&image)
                    .map_err(|e| Error::InternalConsistency(format!("encode image: {}", e)))?;
                println!("{}", out);
                return Ok(());
            }
            println!("manifest: {}", image.manifest_digest);
            println!("total size: {}", image.total_size);
            for (i, layer) in image.layers.iter().enumerate() {
                println!(
                    "{:>3}  {:<9}  {:>12}  {}",
                    i,
                    kind_label(layer.kind()),
                    layer.size,
                    layer.digest
                );
            }
        }
    }
    Ok(())
}

fn kind_label(kind: LayerKind) -> &'static str {
    match kind {
        LayerKind::Bootstrap => "bootstrap",
        LayerKind::Blob => "blob",
        LayerKind::Other => "other",
    }
}
