//! Binary lifecycle: tracing, client wiring, one fetch.

use tracing::{error, info, warn};

use crate::client::FetchClient;
use crate::config::{parse_header, Config};
use crate::error::FetchError;
use crate::request::RequestSpec;

/// Run one fetch after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        method = %config.method,
        max_retries = config.max_retries,
        "safe-fetch starting"
    );

    let client = FetchClient::new(config.settings())?;
    let spec = build_spec(&client, &config)?;

    match client.execute(&spec).await {
        Ok(envelope) => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            if envelope.success {
                Ok(())
            } else {
                warn!(status = envelope.status, "non-success response");
                anyhow::bail!("HTTP {}", envelope.status)
            }
        }
        Err(FetchError::Rejected(rejection)) => {
            error!(reason = %rejection, "request blocked by URL policy");
            Err(FetchError::Rejected(rejection).into())
        }
        Err(e) => {
            error!(error = %e, "fetch failed");
            Err(e.into())
        }
    }
}

fn build_spec(client: &FetchClient, config: &Config) -> anyhow::Result<RequestSpec> {
    let mut spec = client.request(config.method, config.url.as_str());
    for raw in &config.headers {
        let (name, value) = parse_header(raw)?;
        spec = spec.header(name, value);
    }
    if let Some(data) = &config.data {
        spec = if config.json {
            spec.json(serde_json::from_str(data)?)
                .default_header("content-type", "application/json")
        } else {
            spec.body(data.clone())
        };
    }
    Ok(spec)
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the envelope; logs go to stderr.
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
