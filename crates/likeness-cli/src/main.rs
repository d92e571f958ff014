use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.freedesktop.Likeness1",
    default_service = "org.freedesktop.Likeness1",
    default_path = "/org/freedesktop/Likeness1"
)]
trait Likeness {
    async fn register_face(
        &self,
        identity: &str,
        image: &[u8],
        video: &[u8],
        options: &str,
    ) -> zbus::Result<String>;
    async fn search_face_by_image(&self, image: &[u8], exclude: &str) -> zbus::Result<String>;
    async fn close_session(&self, identity: &str) -> zbus::Result<String>;
    async fn link_identities(&self, a: &str, b: &str) -> zbus::Result<Vec<String>>;
    async fn unlink_identity(&self, identity: &str) -> zbus::Result<bool>;
    async fn list_matches(&self, identity: &str) -> zbus::Result<String>;
    async fn index_photo(&self, photo_id: &str, image: &[u8]) -> zbus::Result<String>;
    async fn list_photos(&self, identity: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "likeness", about = "Likeness face registration CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face for an identity
    Register {
        identity: String,
        /// Image file (raw bytes or a data: URI text file)
        #[arg(short, long)]
        image: PathBuf,
        /// Capture video recorded alongside the image
        #[arg(short, long)]
        video: Option<PathBuf>,
        /// MIME type of the video (default: the daemon's)
        #[arg(long)]
        video_mime: Option<String>,
        /// Latitude of the capture location
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Longitude of the capture location
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
        /// Accuracy radius of the capture location in meters
        #[arg(long)]
        accuracy: Option<f64>,
    },
    /// Search for identities whose faces resemble an image
    Search {
        #[arg(short, long)]
        image: PathBuf,
        /// Identity to leave out of the results
        #[arg(long)]
        exclude: Option<String>,
    },
    /// Link two identities belonging to the same person
    Link { a: String, b: String },
    /// Remove an identity from its link group
    Unlink { identity: String },
    /// List historical matches recorded for an identity
    Matches { identity: String },
    /// Abandon an identity's open capture session
    Close { identity: String },
    /// Index a group photo and attribute the registered identities in it
    Photo {
        photo_id: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// List the photos an identity has been attributed to
    Photos { identity: String },
    /// Show daemon status
    Status,
}

fn register_options(
    lat: Option<f64>,
    lon: Option<f64>,
    accuracy: Option<f64>,
    video_mime: Option<String>,
) -> serde_json::Value {
    let mut options = serde_json::Map::new();
    if let (Some(latitude), Some(longitude)) = (lat, lon) {
        options.insert(
            "location".into(),
            serde_json::json!({
                "latitude": latitude,
                "longitude": longitude,
                "accuracy": accuracy,
                "timestamp": chrono::Utc::now(),
                "address": null,
                "provenance": null,
            }),
        );
    }
    if let Some(mime) = video_mime {
        options.insert("video_mime_type".into(), mime.into());
    }
    serde_json::Value::Object(options)
}

async fn read(path: &PathBuf) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_registration(raw: &str) -> Result<()> {
    let result: serde_json::Value = serde_json::from_str(raw)?;
    if result["success"] != true {
        bail!(
            "registration failed ({}): {}",
            result["failure"].as_str().unwrap_or("unknown"),
            result["error"].as_str().unwrap_or("no message")
        );
    }
    println!("Registered face {}", result["face_id"].as_str().unwrap_or("?"));
    if let Some(url) = result["image_url"].as_str() {
        println!("  image:    {url}");
    }
    if let Some(url) = result["video_url"].as_str() {
        println!("  video:    {url}");
    }
    let location = &result["location"];
    match (location["latitude"].as_f64(), location["longitude"].as_f64()) {
        (Some(lat), Some(lon)) => println!(
            "  location: {lat:.5}, {lon:.5} ({}){}",
            location["provenance"].as_str().unwrap_or("unknown"),
            location["address"]
                .as_str()
                .map(|a| format!(" {a}"))
                .unwrap_or_default()
        ),
        _ => println!("  location: none"),
    }
    if let Some(reason) = result["location_error"].as_str() {
        println!("  note:     {reason}");
    }
    if let Some(photos) = result["attributed_photos"].as_array().filter(|p| !p.is_empty()) {
        let ids: Vec<&str> = photos.iter().filter_map(|p| p.as_str()).collect();
        println!("  photos:   {}", ids.join(", "));
    }
    let matches = result["historical_matches"].as_array().cloned().unwrap_or_default();
    println!("  matches:  {}", matches.len());
    for m in &matches {
        println!(
            "    {} (face {}, similarity {:.1})",
            m["target_identity_id"].as_str().unwrap_or("?"),
            m["target_face_id"].as_str().unwrap_or("?"),
            m["similarity"].as_f64().unwrap_or_default()
        );
    }
    Ok(())
}

fn print_photo_matches(photo: &serde_json::Value) {
    for m in photo["matched_users"].as_array().into_iter().flatten() {
        println!(
            "  {} (face {}, similarity {:.1})",
            m["identity_id"].as_str().unwrap_or("?"),
            m["face_id"].as_str().unwrap_or("?"),
            m["similarity"].as_f64().unwrap_or_default()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let daemon = LikenessProxy::new(&connection)
        .await
        .context("likenessd not reachable")?;

    match cli.command {
        Commands::Register {
            identity,
            image,
            video,
            video_mime,
            lat,
            lon,
            accuracy,
        } => {
            let image = read(&image).await?;
            let video = match &video {
                Some(path) => read(path).await?,
                None => Vec::new(),
            };
            let options = register_options(lat, lon, accuracy, video_mime).to_string();
            tracing::debug!(identity = %identity, options = %options, "registering");
            let raw = daemon
                .register_face(&identity, &image, &video, &options)
                .await?;
            if cli.json {
                print_json(&raw)?;
            } else {
                print_registration(&raw)?;
            }
        }
        Commands::Search { image, exclude } => {
            let image = read(&image).await?;
            let raw = daemon
                .search_face_by_image(&image, exclude.as_deref().unwrap_or_default())
                .await?;
            if cli.json {
                print_json(&raw)?;
            } else {
                let hits: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
                if hits.is_empty() {
                    println!("No matching faces");
                }
                for hit in &hits {
                    println!(
                        "{} (face {}, similarity {:.1})",
                        hit["identity_id"].as_str().unwrap_or("?"),
                        hit["face_id"].as_str().unwrap_or("?"),
                        hit["similarity"].as_f64().unwrap_or_default()
                    );
                }
            }
        }
        Commands::Link { a, b } => {
            let group = daemon.link_identities(&a, &b).await?;
            println!("Linked: {}", group.join(", "));
        }
        Commands::Unlink { identity } => {
            daemon.unlink_identity(&identity).await?;
            println!("Unlinked {identity}");
        }
        Commands::Matches { identity } => {
            let raw = daemon.list_matches(&identity).await?;
            if cli.json {
                print_json(&raw)?;
            } else {
                let matches: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
                if matches.is_empty() {
                    println!("No matches recorded for {identity}");
                }
                for m in &matches {
                    println!(
                        "{}  {} (similarity {:.1})",
                        m["matched_at"].as_str().unwrap_or("?"),
                        m["target_identity_id"].as_str().unwrap_or("?"),
                        m["similarity"].as_f64().unwrap_or_default()
                    );
                }
            }
        }
        Commands::Close { identity } => {
            let raw = daemon.close_session(&identity).await?;
            let outcome: serde_json::Value = serde_json::from_str(&raw)?;
            match (outcome["closed"].as_bool(), outcome["video_url"].as_str()) {
                (Some(true), Some(url)) => println!("Session closed; partial video stored at {url}"),
                (Some(true), None) => println!("Session closed"),
                _ => println!("No open session for {identity}"),
            }
        }
        Commands::Photo { photo_id, image } => {
            let image = read(&image).await?;
            let raw = daemon.index_photo(&photo_id, &image).await?;
            if cli.json {
                print_json(&raw)?;
            } else {
                let photo: serde_json::Value = serde_json::from_str(&raw)?;
                println!(
                    "Indexed photo {} ({} faces)",
                    photo_id,
                    photo["face_ids"].as_array().map_or(0, Vec::len)
                );
                print_photo_matches(&photo);
            }
        }
        Commands::Photos { identity } => {
            let raw = daemon.list_photos(&identity).await?;
            if cli.json {
                print_json(&raw)?;
            } else {
                let photos: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
                if photos.is_empty() {
                    println!("No photos attributed to {identity}");
                }
                for photo in &photos {
                    println!(
                        "{}  {}",
                        photo["photo_id"].as_str().unwrap_or("?"),
                        photo["image_url"].as_str().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Status => {
            print_json(&daemon.status().await?)?;
        }
    }

    Ok(())
}
