use clap::Parser;
use color_eyre::eyre::WrapErr;
use s3archive::{ArchiveRequest, Archiver, UploadOptions, S3};

mod progress;

/// Pack S3 objects into a single zip or tar archive, and upload the archive back to S3.
///
/// Prints the bucket, key and size of the uploaded archive as JSON.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The bucket holding the objects to archive.  The archive is written to this bucket too.
    #[clap(value_name = "BUCKET")]
    bucket: String,

    /// The prefix of the objects to archive, without a trailing `/`.
    ///
    /// Unless `--file` is given, every object whose key starts with this prefix goes into the
    /// archive.  The archive itself is written under this prefix.
    #[clap(value_name = "PATH", default_value = "")]
    path: String,

    /// Archive only this file under PATH.  May be given more than once; entries are written in
    /// the order given.
    #[clap(long = "file", value_name = "NAME")]
    files: Vec<String>,

    /// Name of the archive, without the extension
    #[clap(short = 'o', long, default_value = s3archive::DEFAULT_OUTPUT_FILENAME)]
    output_filename: String,

    /// Archive format, `zip` or `tar`.  Anything else means zip.
    #[clap(short = 'f', long, default_value = "zip")]
    format: String,

    /// Option for the upload of the archive, as `KEY=VALUE`.  May be given more than once.
    ///
    /// VALUE is parsed as JSON if it can be, otherwise it's taken as a string.
    ///
    /// EXAMPLES:
    ///
    /// --upload-option StorageClass=STANDARD_IA
    ///
    /// --upload-option 'Metadata={"job": "42"}'
    #[clap(long = "upload-option", value_name = "KEY=VALUE", value_parser = parse_upload_option)]
    upload_options: Vec<(String, serde_json::Value)>,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: s3archive::Config,
}

/// Arguments that control output, rather than what is archived
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

fn parse_upload_option(option: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = option
        .split_once('=')
        .ok_or_else(|| format!("'{option}' is not of the form KEY=VALUE"))?;

    if key.is_empty() {
        return Err(format!("'{option}' has an empty KEY"));
    }

    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    Ok((key.to_string(), value))
}

fn init_logging(globals: &Globals) {
    let default_filter = if globals.verbose {
        "s3archive=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_logging(&args.globals);

    let upload_options = args.upload_options.into_iter().collect::<UploadOptions>();
    let request = ArchiveRequest::new(args.bucket, args.path)
        .with_source_files(args.files)
        .with_output_filename(args.output_filename)
        .with_output_format(&args.format)
        .with_upload_options(upload_options);

    let storage = S3::from_config(args.config.clone()).await;
    let archiver = Archiver::new(storage, args.config);

    let result = progress::run_archive(&args.globals, &archiver, request)
        .await
        .wrap_err("Archive failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
