use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use medley::config::{ServeConfig, ServeOverrides};
use medley::smart::{
    self, Dispatcher, LocalTransport, ProtocolVersion, Registry, SmartClient, TcpServer,
};
use medley::text::{
    split_lines, unified_diff, Annotator, ConflictStyle, IndicatifProgress, Key, Line, Merge3,
    MergeOptions, MemoryStore, ProgressReporter,
};
use serde::Serialize;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "medley",
    about = "Smart-protocol file server and line-annotation toolkit",
    version
)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a directory over the smart protocol
    Serve {
        /// Serve one connection on stdin/stdout instead of listening
        #[arg(long)]
        inet: bool,

        #[arg(long, env = "MEDLEY_HOST")]
        host: Option<String>,

        #[arg(long, env = "MEDLEY_PORT")]
        port: Option<u16>,

        /// Directory to serve (default: current directory)
        #[arg(long)]
        directory: Option<PathBuf>,

        /// Accept write requests
        #[arg(long)]
        allow_writes: bool,

        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Send one request to a smart server and print the response
    Call {
        /// bzr://host[:port]/ or bzr+ssh://[user@]host[:port]/path
        url: String,

        verb: String,

        args: Vec<String>,

        /// Send this file as the request body
        #[arg(long)]
        body_file: Option<PathBuf>,

        /// Read a response body and write it to stdout
        #[arg(long)]
        expect_body: bool,

        /// Force a protocol version instead of negotiating
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=3))]
        protocol: Option<u8>,
    },

    /// Annotate the last file, treating the files as successive revisions
    Annotate {
        /// Emit JSON
        #[arg(long)]
        json: bool,

        /// Show the origin on every line, not just where it changes
        #[arg(long)]
        all: bool,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Unified diff using patience matching
    Diff {
        old: PathBuf,

        new: PathBuf,

        /// Lines of context
        #[arg(short = 'U', long, default_value_t = 3)]
        context: usize,
    },

    /// Three-way merge of THIS and OTHER against BASE
    Merge {
        base: PathBuf,

        this: PathBuf,

        other: PathBuf,

        /// Include base text in conflicts
        #[arg(long, conflicts_with = "reprocess")]
        show_base: bool,

        /// Trim conflicts down to the lines that really differ
        #[arg(long)]
        reprocess: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Serve {
            inet,
            host,
            port,
            directory,
            allow_writes,
            config,
        } => {
            let config = ServeConfig::load(config.as_deref())
                .context("Failed to load config")?
                .apply(ServeOverrides {
                    host,
                    port,
                    directory,
                    allow_writes,
                });
            serve(&config, inet)
        }
        Command::Call {
            url,
            verb,
            args,
            body_file,
            expect_body,
            protocol,
        } => call(&url, &verb, &args, body_file.as_deref(), expect_body, protocol),
        Command::Annotate { json, all, files } => annotate(&files, json, all),
        Command::Diff { old, new, context } => diff(&old, &new, context),
        Command::Merge {
            base,
            this,
            other,
            show_base,
            reprocess,
        } => merge(&base, &this, &other, show_base, reprocess),
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    // stdout carries protocol bytes under `serve --inet`
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn serve(config: &ServeConfig, inet: bool) -> Result<()> {
    let root = config.resolved_directory();
    let transport = LocalTransport::new(&root, !config.allow_writes)
        .with_context(|| format!("Cannot serve {}", root.display()))?;
    let dispatcher = Dispatcher::new(
        Arc::new(Registry::with_default_verbs()),
        Arc::new(transport),
    );

    if inet {
        let stdin = io::stdin().lock();
        let stdout = BufWriter::new(io::stdout().lock());
        smart::serve_pipes(stdin, stdout, dispatcher).context("Serving stdin/stdout failed")?;
        return Ok(());
    }

    let server = TcpServer::bind(&config.host, config.port, dispatcher)
        .with_context(|| format!("Failed to listen on {}:{}", config.host, config.port))?;
    info!(
        root = %root.display(),
        read_only = !config.allow_writes,
        "serving on {}",
        server.url()
    );
    server.serve()?;
    Ok(())
}

fn call(
    url: &str,
    verb: &str,
    args: &[String],
    body_file: Option<&Path>,
    expect_body: bool,
    protocol: Option<u8>,
) -> Result<()> {
    let mut client = SmartClient::connect(url)?;
    if let Some(version) = protocol.and_then(ProtocolVersion::from_u8) {
        client = client.with_protocol_version(version);
    }

    let mut request: Vec<&str> = vec![verb];
    request.extend(args.iter().map(String::as_str));

    let body = match body_file {
        Some(path) => Some(
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => None,
    };

    let (resp, resp_body) = match (body, expect_body) {
        (None, false) => (client.call(&request)?, None),
        (None, true) => {
            let (resp, body) = client.call_expecting_body(&request)?;
            (resp, Some(body))
        }
        (Some(body), false) => (client.call_with_body_bytes(&request, &body)?, None),
        (Some(body), true) => {
            let (resp, body) = client.call_with_body_bytes_expecting_body(&request, &body)?;
            (resp, Some(body))
        }
    };

    let version = client.protocol_version()?;
    eprintln!("{} {}", format!("[{}]", version).dimmed(), resp.join(" ").green());
    if let Some(body) = resp_body {
        let mut stdout = io::stdout().lock();
        stdout.write_all(&body)?;
        stdout.flush()?;
    }
    Ok(())
}

fn read_lines(path: &Path) -> Result<Vec<Line>> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(split_lines(&data.into()))
}

#[derive(Serialize)]
struct AnnotatedLine {
    origin: Key,
    text: String,
}

fn annotate(files: &[PathBuf], json: bool, all: bool) -> Result<()> {
    let mut store = MemoryStore::new();
    let mut parents = Vec::new();
    let mut tip = None;
    for path in files {
        let key = Key::from(path.display().to_string());
        store.add_lines(key.clone(), parents, read_lines(path)?);
        parents = vec![key.clone()];
        tip = Some(key);
    }
    let Some(tip) = tip else {
        bail!("No files to annotate");
    };

    let mut annotator = Annotator::new(&store);
    let mut progress = if io::stderr().is_terminal() {
        IndicatifProgress::new()
    } else {
        IndicatifProgress::hidden()
    };
    annotator.annotate_with_progress(&tip, Some(&mut progress as &mut dyn ProgressReporter))?;
    let lines = annotator.annotate_flat(&tip)?;

    if json {
        let out: Vec<AnnotatedLine> = lines
            .into_iter()
            .map(|(origin, line)| AnnotatedLine {
                origin,
                text: String::from_utf8_lossy(&line).into_owned(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let width = lines
        .iter()
        .map(|(origin, _)| origin.to_string().len())
        .max()
        .unwrap_or(0);
    let mut stdout = io::stdout().lock();
    let mut previous: Option<&Key> = None;
    for (origin, line) in &lines {
        let label = if all || previous != Some(origin) {
            origin.to_string()
        } else {
            String::new()
        };
        write!(stdout, "{} | ", format!("{:<width$}", label, width = width).cyan())?;
        stdout.write_all(line)?;
        if !line.ends_with(b"\n") {
            writeln!(stdout)?;
        }
        previous = Some(origin);
    }
    stdout.flush()?;
    Ok(())
}

fn diff(old: &Path, new: &Path, context: usize) -> Result<()> {
    let a = read_lines(old)?;
    let b = read_lines(new)?;
    let out = unified_diff(
        &a,
        &b,
        &old.display().to_string(),
        &new.display().to_string(),
        context,
    );

    let mut stdout = io::stdout().lock();
    for line in &out {
        let text = String::from_utf8_lossy(line);
        let colored = if text.starts_with("---") || text.starts_with("+++") {
            text.bold()
        } else if text.starts_with('@') {
            text.cyan()
        } else if text.starts_with('+') {
            text.green()
        } else if text.starts_with('-') {
            text.red()
        } else {
            text.normal()
        };
        write!(stdout, "{}", colored)?;
    }
    stdout.flush()?;
    Ok(())
}

fn merge(base: &Path, this: &Path, other: &Path, show_base: bool, reprocess: bool) -> Result<()> {
    let base_lines = read_lines(base)?;
    let this_lines = read_lines(this)?;
    let other_lines = read_lines(other)?;

    let style = if show_base {
        ConflictStyle::ShowBase
    } else if reprocess {
        ConflictStyle::Reprocess
    } else {
        ConflictStyle::Plain
    };
    let opts = MergeOptions {
        name_a: Some(this.display().to_string()),
        name_b: Some(other.display().to_string()),
        name_base: show_base.then(|| base.display().to_string()),
        style,
    };
    let merged = Merge3::new(&base_lines, &this_lines, &other_lines).merge_lines(&opts);

    let mut stdout = io::stdout().lock();
    for line in &merged.lines {
        stdout.write_all(line)?;
    }
    stdout.flush()?;

    if merged.conflicts {
        eprintln!("{}", "Text conflict".yellow());
        std::process::exit(1);
    }
    Ok(())
}
