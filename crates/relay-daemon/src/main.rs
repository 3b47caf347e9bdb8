use anyhow::Result;

use relay_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("relay-daemon")?;
    relay_daemon::server::run().await
}
