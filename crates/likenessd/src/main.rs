use anyhow::{Context, Result};
use likeness_capture::geocode::{http_client, IpApiLocator, NominatimGeocoder};
use likeness_capture::location::{
    DeviceSource, Geolocation, IpSource, LocationResolver, LocationSource, NoGeolocation,
    PositionOptions, ReverseGeocoder, StaticGeolocation,
};
use likeness_core::persistence::Persistence;
use likeness_core::rekognition::RekognitionProvider;
use likeness_core::ObjectStore;
use likeness_store::{FsObjectStore, S3ObjectStore, SqliteKvStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod orchestrator;

use config::Config;

const BUS_NAME: &str = "org.freedesktop.Likeness1";
const OBJECT_PATH: &str = "/org/freedesktop/Likeness1";

fn build_resolver(config: &Config) -> Result<LocationResolver> {
    let client = http_client(Duration::from_secs(config.http_timeout_secs))?;

    let geocoder: Option<Arc<dyn ReverseGeocoder>> = if config.nominatim_url.is_empty() {
        None
    } else {
        Some(Arc::new(NominatimGeocoder::with_client(
            client.clone(),
            &config.nominatim_url,
        )))
    };

    let geolocation: Arc<dyn Geolocation> = match config.kiosk_position() {
        Some((latitude, longitude)) => Arc::new(StaticGeolocation {
            latitude,
            longitude,
            accuracy: config.kiosk_accuracy_m,
        }),
        None => Arc::new(NoGeolocation),
    };
    let options = PositionOptions {
        timeout: Duration::from_secs(config.geolocation_timeout_secs),
        ..PositionOptions::default()
    };

    let mut sources: Vec<Box<dyn LocationSource>> =
        vec![Box::new(DeviceSource::new(geolocation, geocoder.clone(), options))];
    if !config.ipapi_url.is_empty() {
        sources.push(Box::new(IpSource::new(Arc::new(IpApiLocator::with_client(
            client,
            &config.ipapi_url,
        )))));
    }

    let resolver = LocationResolver::new(sources);
    Ok(match geocoder {
        Some(geocoder) => resolver.with_geocoder(geocoder),
        None => resolver,
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("likenessd starting");

    let config = Config::from_env()?;
    tracing::info!(
        collection = %config.collection_id,
        db = %config.db_path.display(),
        bucket = ?config.bucket,
        storage_dir = ?config.storage_dir,
        "configuration loaded"
    );

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.aws_region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let sdk = loader.load().await;
    let region = sdk
        .region()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "us-east-1".to_string());

    let provider = Arc::new(RekognitionProvider::new(
        aws_sdk_rekognition::Client::new(&sdk),
        config.collection_id.clone(),
    ));

    let objects: Arc<dyn ObjectStore> = match (&config.bucket, &config.storage_dir) {
        (Some(bucket), _) => {
            let store = S3ObjectStore::new(aws_sdk_s3::Client::new(&sdk), bucket.clone(), &region);
            match &config.public_base_url {
                Some(base) => Arc::new(store.with_public_base(base.clone())),
                None => Arc::new(store),
            }
        }
        (None, Some(dir)) => Arc::new(FsObjectStore::new(dir.clone())),
        (None, None) => return Err(config::ConfigError::MissingStorage.into()),
    };

    let kv = SqliteKvStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening record store {}", config.db_path.display()))?;
    let persistence = Arc::new(Persistence::new(Arc::new(kv)));

    let resolver = Arc::new(build_resolver(&config)?);
    tracing::info!(sources = ?resolver.source_names(), "location resolver ready");

    let orchestrator = orchestrator::Orchestrator::new(provider, objects, persistence, resolver);
    let engine = engine::spawn_engine(
        orchestrator,
        engine::EngineSettings {
            video_mime_type: config.video_mime_type.clone(),
            max_video_bytes: config.max_video_bytes,
            host_fingerprint: config.host_fingerprint,
            collection_id: config.collection_id.clone(),
            session_idle_timeout: Duration::from_secs(config.session_idle_secs),
        },
    );

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::LikenessService { engine })?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = BUS_NAME, session_bus = config.session_bus, "likenessd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("likenessd shutting down");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let mut all = vec![
            ("LIKENESS_COLLECTION_ID", "faces"),
            ("LIKENESS_STORAGE_DIR", "/tmp/likeness"),
        ];
        all.extend_from_slice(vars);
        Config::from_lookup(|key| {
            all.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap()
    }

    #[test]
    fn test_resolver_chain_order() {
        let resolver = build_resolver(&config(&[])).unwrap();
        assert_eq!(resolver.source_names(), vec!["device", "ip"]);
    }

    #[test]
    fn test_ip_fallback_can_be_disabled() {
        let resolver = build_resolver(&config(&[("LIKENESS_IPAPI_URL", "")])).unwrap();
        assert_eq!(resolver.source_names(), vec!["device"]);
    }

    #[tokio::test]
    async fn test_kiosk_position_resolves_without_network() {
        let resolver = build_resolver(&config(&[
            ("LIKENESS_KIOSK_LATITUDE", "59.33"),
            ("LIKENESS_KIOSK_LONGITUDE", "18.06"),
            ("LIKENESS_NOMINATIM_URL", ""),
            ("LIKENESS_IPAPI_URL", ""),
        ]))
        .unwrap();
        let resolution = resolver.resolve().await;
        assert!(resolution.error.is_none());
        let record = resolution.record;
        assert_eq!(record.latitude, Some(59.33));
        assert_eq!(record.provenance, Some(likeness_core::Provenance::DeviceGeolocation));
    }
}
