//! Node-wide commands: `status`, `update check` and `kill`.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use adnode_core::ipc::{ErrorCode, IpcError, IpcRequest, IpcResponse, NodeStatus};
use anyhow::{Context, Result, bail};
use tokio::time::Instant;

use super::{format_duration, print_json, print_message};
use crate::client::{ClientError, OperatorClient, UPDATE_CHECK_TIMEOUT_SECS};

/// Interval between pings while waiting for the node to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Shows the node's status.
pub async fn status(client: &mut OperatorClient, json: bool) -> Result<()> {
    let response = client
        .call(&IpcRequest::Status)
        .await
        .context("failed to get node status")?;
    let IpcResponse::Status(status) = response else {
        bail!("unexpected response to status: {response:?}");
    };

    if json {
        return print_json(&status);
    }
    print!("{}", render_status(&status));
    Ok(())
}

/// Asks the node to check for a new release now.
///
/// The node answers after the whole attempt, which includes draining and
/// the successor's health check when an update is found.
pub async fn update_check(client: &mut OperatorClient, json: bool) -> Result<()> {
    client.set_timeout(Duration::from_secs(UPDATE_CHECK_TIMEOUT_SECS));
    let response = match client.call(&IpcRequest::CheckForUpdate).await {
        Ok(response) => response,
        Err(e) if e.code() == Some(ErrorCode::NotSupported) => {
            bail!("self-update is disabled in this node's configuration")
        },
        Err(e) => return Err(e).context("update check failed"),
    };
    let IpcResponse::UpdateCheck { outcome, message } = response else {
        bail!("unexpected response to check_for_update: {response:?}");
    };

    if json {
        return print_json(&serde_json::json!({ "outcome": outcome, "message": message }));
    }
    match message {
        Some(message) => println!("{outcome}: {message}"),
        None => println!("{outcome}"),
    }
    Ok(())
}

/// Stops the node. With `wait`, blocks until the operator socket stops
/// answering or `timeout` passes.
pub async fn kill(
    client: &mut OperatorClient,
    socket_path: &Path,
    wait: Option<Duration>,
    json: bool,
) -> Result<()> {
    let response = client
        .call(&IpcRequest::Shutdown)
        .await
        .context("failed to send shutdown request")?;
    let IpcResponse::Ok { message } = response else {
        bail!("unexpected response to shutdown: {response:?}");
    };

    if let Some(timeout) = wait {
        wait_for_exit(socket_path, timeout).await?;
        return print_message("node stopped", json);
    }
    print_message(message.as_deref().unwrap_or("shutdown requested"), json)
}

async fn wait_for_exit(socket_path: &Path, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match OperatorClient::connect_with_timeout(socket_path, EXIT_POLL_INTERVAL).await {
            Err(ClientError::Ipc(IpcError::NodeNotRunning(_))) => return Ok(()),
            Ok(mut client) => {
                if matches!(
                    client.call(&IpcRequest::Ping).await,
                    Err(ClientError::Ipc(IpcError::Protocol(_) | IpcError::Io(_)))
                ) {
                    return Ok(());
                }
            },
            Err(_) => {},
        }
        if Instant::now() >= deadline {
            bail!(
                "node still answering on {} after {}",
                socket_path.display(),
                format_duration(timeout.as_secs())
            );
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

fn render_status(status: &NodeStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Version:      {}", status.version);
    let _ = writeln!(out, "PID:          {}", status.pid);
    let _ = writeln!(out, "Uptime:       {}", format_duration(status.uptime_secs));
    let _ = writeln!(out, "Update state: {}", status.update_state);
    let _ = writeln!(
        out,
        "Endpoint:     {}",
        if status.accepting { "accepting" } else { "paused" }
    );
    let _ = writeln!(out, "Active links: {}", status.active_links);
    let _ = writeln!(out, "Tracked visitor/campaign pairs: {}", status.tracked_pairs);
    let _ = writeln!(
        out,
        "Visits:       {} accepted, {} duplicate, {} rejected",
        status.accepted, status.duplicate, status.rejected
    );
    let _ = writeln!(out, "Awaiting reconcile: {}", status.awaiting_reconcile);
    let _ = writeln!(out, "Pending 2FA codes:  {}", status.pending_codes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_summary() {
        let status = NodeStatus {
            version: "0.4.1".into(),
            pid: 4242,
            uptime_secs: 3_700,
            update_state: "running".into(),
            accepting: false,
            active_links: 3,
            tracked_pairs: 17,
            accepted: 10,
            duplicate: 2,
            rejected: 1,
            awaiting_reconcile: 0,
            pending_codes: 1,
        };
        let rendered = render_status(&status);
        assert!(rendered.contains("Version:      0.4.1"));
        assert!(rendered.contains("Uptime:       1h 1m"));
        assert!(rendered.contains("Endpoint:     paused"));
        assert!(rendered.contains("10 accepted, 2 duplicate, 1 rejected"));
    }
}
