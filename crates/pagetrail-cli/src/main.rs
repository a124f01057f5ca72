use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pagetrail_tracker::config::{
    load_tracker_config, API_URL_ATTR, INCLUDE_QUERY_ATTR, SITE_KEY_ATTR,
};
use pagetrail_tracker::transport::SentRequest;
use pagetrail_tracker::{
    DeliveryChannel, HostPage, RecordingTransport, ScriptTag, SystemClock, Tracker, TrackInput,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod replay;

#[derive(Parser)]
#[command(name = "pagetrail", version, about = "pagetrail tracker CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a single page view or custom event
    Send {
        /// Page location the payload is reported for
        #[arg(long)]
        url: String,
        /// Script src the tracker was loaded from
        #[arg(long)]
        src: String,
        #[arg(long)]
        site_key: Option<String>,
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long)]
        include_query: bool,
        /// Event name (omit for a page view)
        #[arg(long)]
        name: Option<String>,
        /// Properties in key=value format (can be specified multiple times)
        #[arg(long = "prop", value_name = "KEY=VALUE")]
        props: Vec<String>,
        /// Properties as raw JSON or text
        #[arg(long, conflicts_with = "props")]
        properties: Option<String>,
        #[arg(long, default_value = "")]
        referrer: String,
        #[arg(long, default_value_t = 1280)]
        width: u32,
        /// Print the request instead of sending it
        #[arg(long)]
        dry_run: bool,
    },
    /// Replay a scripted page session
    Replay {
        /// TOML replay script
        file: PathBuf,
        /// Print the requests instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_props(props: &[String]) -> Result<Value> {
    let mut map = serde_json::Map::new();
    for prop in props {
        let (key, value) = prop
            .split_once('=')
            .with_context(|| format!("Invalid property '{}', expected KEY=VALUE", prop))?;
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(map))
}

fn print_requests(requests: &[SentRequest]) -> Result<()> {
    for request in requests {
        let line = json!({ "url": request.url, "body": request.body_json() });
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_send(
    url: String,
    src: String,
    site_key: Option<String>,
    api_url: Option<String>,
    include_query: bool,
    name: Option<String>,
    props: Vec<String>,
    properties: Option<String>,
    referrer: String,
    width: u32,
    dry_run: bool,
) -> Result<()> {
    let mut tag = ScriptTag::new(src);
    if let Some(site_key) = site_key {
        tag = tag.with_attribute(SITE_KEY_ATTR, site_key);
    }
    if let Some(api_url) = api_url {
        tag = tag.with_attribute(API_URL_ATTR, api_url);
    }
    if include_query {
        tag = tag.with_attribute(INCLUDE_QUERY_ATTR, "true");
    }

    let config = load_tracker_config(&tag)?;
    if !config.enabled {
        bail!("tracking is disabled (PAGETRAIL_DISABLED / DO_NOT_TRACK / config)");
    }
    let resolved = config.resolve()?;

    let recorder = RecordingTransport::new();
    let channel = if dry_run {
        DeliveryChannel::new(&resolved, Arc::new(recorder.clone()))
    } else {
        DeliveryChannel::detect(&resolved)
    };

    let page = HostPage::new(url)
        .with_referrer(referrer)
        .with_viewport_width(width);
    let tracker = Tracker::new(resolved, Arc::new(page), Arc::new(SystemClock), channel);

    let mut input = match name {
        Some(name) => TrackInput::event(name),
        None => TrackInput::page_view(),
    };
    if let Some(text) = properties {
        let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        input = input.field("properties", value);
    } else if !props.is_empty() {
        input = input.field("properties", parse_props(&props)?);
    }

    tracker.track(Some(&input.into_value()));
    tracker.close();

    print_requests(&recorder.take())
}

fn cmd_replay(file: PathBuf, dry_run: bool) -> Result<()> {
    let script = replay::load_script(&file)?;
    let requests = replay::run(&script, dry_run)?;
    print_requests(&requests)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Send {
            url,
            src,
            site_key,
            api_url,
            include_query,
            name,
            props,
            properties,
            referrer,
            width,
            dry_run,
        } => cmd_send(
            url,
            src,
            site_key,
            api_url,
            include_query,
            name,
            props,
            properties,
            referrer,
            width,
            dry_run,
        )?,
        Command::Replay { file, dry_run } => cmd_replay(file, dry_run)?,
    }
    Ok(())
}
