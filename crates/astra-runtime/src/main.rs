//! Astra Runtime - instrumented realm with a remote-call channel
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────┐
//! │ Realm (native primitives)    │        │  controller  │
//! │  ├─ Instrumentation (__astra)│◄──────►│  (ws peer)   │
//! │  └─ RemoteChannel  (__jsrpc) │        └──────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! # Startup
//!
//! 1. **Load astra.toml** - `[jsrpc]` and `[capture]` tables, CLI overrides
//! 2. **Build realm** - native WebSocket / fetch / XHR primitives
//! 3. **Attach instrumentation** - capture adapters, signature hooks, `__astra`
//! 4. **Start channel** - after the configured startup delay
//! 5. **Wait for Ctrl-C** - then disconnect and detach
//!
//! # Environment Variables
//!
//! - `ASTRA_LOG` - Log filter (default: "info")

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use ext_intercept::net::NativeSocketFactory;
use ext_intercept::{Instrumentation, Realm};
use ext_jsrpc::RemoteChannel;

mod config;

use config::AstraConfig;

const USAGE: &str = "Usage: astra-runtime [--config <path>] [--url <ws-url>] [--allow-code]";

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    url: Option<String>,
    allow_code: bool,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().context("--config requires a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--url" => {
                    parsed.url = Some(args.next().context("--url requires a websocket url")?);
                }
                "--allow-code" => parsed.allow_code = true,
                "-h" | "--help" => anyhow::bail!(USAGE),
                other => anyhow::bail!("unknown argument '{}'\n{}", other, USAGE),
            }
        }
        Ok(parsed)
    }

    fn apply(&self, config: &mut AstraConfig) {
        if let Some(url) = &self.url {
            config.jsrpc.url = url.clone();
        }
        if self.allow_code {
            config.jsrpc.allow_code = true;
        }
    }
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("creating tokio runtime")?;

    // Use ASTRA_LOG for the filter, default to "info"
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("ASTRA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse(env::args().skip(1))?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let mut config = AstraConfig::load(args.config.as_deref()).await?;
    args.apply(&mut config);

    let realm = Arc::new(Realm::native().context("building native realm")?);
    let instrumentation = Instrumentation::attach(realm.clone(), config.capture.clone());

    // The channel's own socket bypasses capture.
    let channel = RemoteChannel::new(
        realm.clone(),
        Arc::new(NativeSocketFactory::new()),
        config.jsrpc.clone(),
    );
    channel.publish_api();
    channel.connect_after(config.jsrpc.startup_delay());

    tracing::info!(
        url = %config.jsrpc.url,
        group = %config.jsrpc.group,
        name = %config.jsrpc.name,
        "astra runtime started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    tracing::info!(
        state = %channel.state(),
        events = instrumentation.events().len(),
        "shutting down"
    );
    channel.disconnect();
    instrumentation.detach();
    Ok(())
}
