use std::error::Error;
use std::sync::Arc;

use ntfy_tabs::settings::FileSettingsProvider;
use ntfy_tabs::sink::LogSink;
use ntfy_tabs::stream::client::StreamReader;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // {"url":"https://ntfy.sh","topics":"REPLACE_WITH_TOPIC","accessToken":""}
    let settings_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ntfy-settings.json".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let provider = Arc::new(FileSettingsProvider::new(settings_path));
        let reader = StreamReader::new(provider, Arc::new(LogSink))?;

        // Only returns when the settings file lacks an url or topics.
        match reader.run().await {
            Ok(never) => match never {},
            Err(err) => Err::<(), Box<dyn Error>>(err.into()),
        }
    })
}
