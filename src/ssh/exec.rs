//! One-shot remote command execution over an exec channel

use std::time::Duration;

use russh::ChannelMsg;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::SshError;
use super::handle_owner::HandleController;

/// Max bytes kept per output stream of one command (1 MB)
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Append `data`, dropping whatever would grow `buf` past `MAX_OUTPUT_SIZE`
fn append_capped(buf: &mut Vec<u8>, data: &[u8]) {
    let room = MAX_OUTPUT_SIZE.saturating_sub(buf.len());
    buf.extend_from_slice(&data[..data.len().min(room)]);
}

/// Run `command` on the remote host and return its stdout.
///
/// A nonzero exit status is an error carrying the first line of stderr.
pub async fn exec_command(
    controller: &HandleController,
    command: &str,
    read_timeout: Duration,
) -> Result<Vec<u8>, SshError> {
    let mut channel = controller.open_session_channel().await?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ChannelError(format!("Failed to exec: {}", e)))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status: Option<u32> = None;

    let result = timeout(read_timeout, async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => append_capped(&mut stdout, &data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => append_capped(&mut stderr, &data),
                Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                    exit_status = Some(code);
                }
                Some(ChannelMsg::Close) | None => break,
                Some(other) => trace!("exec channel message: {:?}", other),
            }
        }
    })
    .await;

    let _ = channel.close().await;

    if result.is_err() {
        return Err(SshError::Timeout(format!(
            "'{}' did not finish within {}ms",
            command,
            read_timeout.as_millis()
        )));
    }

    match exit_status {
        Some(0) | None => {
            debug!("exec '{}' returned {} bytes", command, stdout.len());
            Ok(stdout)
        }
        Some(code) => {
            let stderr = String::from_utf8_lossy(&stderr);
            Err(SshError::command_failed(
                format!("exit status {}", code),
                stderr.lines().next(),
            ))
        }
    }
}
