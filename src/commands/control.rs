use std::path::PathBuf;

#[cfg(unix)]
pub(crate) async fn cmd_control(config: Option<PathBuf>, command: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use hostagent::daemon::send_command;

    let config = super::load_config(config)?;
    let reply = send_command(&config.control_socket, command, config.timeout())
        .await
        .with_context(|| {
            format!(
                "Cannot connect to control socket {}, is the agent running?",
                config.control_socket.display()
            )
        })?;
    println!("{}", reply.trim_end());
    Ok(())
}

#[cfg(not(unix))]
pub(crate) async fn cmd_control(_config: Option<PathBuf>, _command: &str) -> anyhow::Result<()> {
    anyhow::bail!("The control socket is only available on Unix")
}
