use hostagent::daemon::Agent;
use std::path::PathBuf;

pub(crate) async fn cmd_run(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    Agent::new(config).run().await
}
