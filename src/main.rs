use mnemos::config::Config;
use mnemos::App;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    let violations = config.production_violations();
    if !violations.is_empty() {
        if config.dev_mode {
            for violation in &violations {
                tracing::warn!("dev mode: {violation}");
            }
        } else {
            for violation in &violations {
                tracing::error!("{violation}");
            }
            anyhow::bail!("refusing to start with insecure configuration");
        }
    }

    let app = App::build(config).await?;
    app.start_maintenance();
    mnemos::api::serve(app).await
}
