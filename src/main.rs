//! Command-line front end for the nearfeed discovery cache.
//!
//! Each invocation opens the cache under the data directory, runs one use
//! case, and prints the result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::info;

use nearfeed::{init_tracing, open_service, AppConfig, DiscoveryService, Position, StaticSession};

const DEFAULT_DATA_DIR: &str = ".nearfeed";

const USAGE: &str = "usage: nearfeed [--data-dir DIR] [--user ID] <command>

commands:
  config                          print the effective configuration
  categories                      load the category tree if the table is empty
  nearby <lat> <lng> <category>   venues of a category around a position
  recommended <lat> <lng>         recommended venues around a position
  search <lat> <lng> <query>      provider venue search
  details <venue-id>              venue detail blob
  similar <venue-id>              venues similar to a venue
  bestsellers <list>              current bestseller list
  locate <address>                geocode an address and use it as the position
  move <lat> <lng>                apply a position update";

struct Invocation {
    data_dir: PathBuf,
    user_id: Option<String>,
    command: Vec<String>,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Invocation> {
    let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut user_id = None;
    let mut command = Vec::new();
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => {
                data_dir = args.next().map(PathBuf::from).context("--data-dir needs a value")?;
            }
            "--user" => {
                user_id = Some(args.next().context("--user needs a value")?);
            }
            "-h" | "--help" => bail!("{USAGE}"),
            _ => {
                command.push(arg);
                command.extend(args.by_ref());
            }
        }
    }
    if command.is_empty() {
        bail!("{USAGE}");
    }
    Ok(Invocation {
        data_dir,
        user_id,
        command,
    })
}

fn parse_position(lat: &str, lng: &str) -> Result<Position> {
    let position = Position::new(
        lat.parse().with_context(|| format!("invalid latitude {lat:?}"))?,
        lng.parse().with_context(|| format!("invalid longitude {lng:?}"))?,
    );
    if !position.is_valid() {
        bail!("position {lat},{lng} is out of range");
    }
    Ok(position)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(service: &DiscoveryService, config: &AppConfig, command: &[String]) -> Result<()> {
    let args: Vec<&str> = command.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["config"] => print_json(&config.public_profile()),
        ["categories"] => print_json(&service.ensure_category_table().await?),
        ["nearby", lat, lng, category] => {
            let position = parse_position(lat, lng)?;
            print_json(&service.nearby_venues(position, category).await?)
        }
        ["recommended", lat, lng] => {
            let position = parse_position(lat, lng)?;
            print_json(&service.recommended_venues(position).await?)
        }
        ["search", lat, lng, query @ ..] if !query.is_empty() => {
            let position = parse_position(lat, lng)?;
            print_json(&service.search_venues(position, &query.join(" ")).await?)
        }
        ["details", venue_id] => print_json(&service.venue_details(venue_id).await?),
        ["similar", venue_id] => print_json(&service.similar_venues(venue_id).await?),
        ["bestsellers", list] => print_json(&service.bestsellers(list).await?),
        ["locate", address @ ..] if !address.is_empty() => {
            let found = service.set_location_from_address(&address.join(" ")).await?;
            print_json(&serde_json::json!({ "found": found, "position": service.current_position() }))
        }
        ["move", lat, lng] => {
            let accepted = service.accept_position(parse_position(lat, lng)?)?;
            print_json(&serde_json::json!({ "accepted": accepted }))
        }
        _ => Err(anyhow!("unrecognised command {:?}\n\n{USAGE}", command.join(" "))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let invocation = parse_args(std::env::args().skip(1))?;
    let config = AppConfig::from_env();

    let session = match &invocation.user_id {
        Some(user_id) => StaticSession::signed_in(user_id.clone()),
        None => StaticSession::anonymous(),
    };
    let service = open_service(&invocation.data_dir, &config, Arc::new(session))
        .with_context(|| format!("failed to open {}", invocation.data_dir.display()))?;
    info!(command = %invocation.command.join(" "), "nearfeed starting");

    run(&service, &config, &invocation.command).await
}
