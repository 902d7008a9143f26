//! `adnode 2fa ...`
//!
//! Two-factor codes arrive through the node's registration flow and wait
//! here until the operator reads one and marks it used.

use std::fmt::Write as _;

use adnode_core::ipc::{ErrorCode, IpcRequest, IpcResponse};
use adnode_core::twofactor::TwoFactorCode;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};

use super::{format_remaining, print_json, print_message};
use crate::client::OperatorClient;

/// Lists codes that are still retrievable.
pub async fn list(client: &mut OperatorClient, json: bool) -> Result<()> {
    let response = client
        .call(&IpcRequest::ListPendingCodes)
        .await
        .context("failed to list two-factor codes")?;
    let IpcResponse::CodeList { codes } = response else {
        bail!("unexpected response to list_pending_codes: {response:?}");
    };

    if json {
        return print_json(&codes);
    }
    print!("{}", render_codes(&codes, Utc::now()));
    Ok(())
}

/// Marks a code as used.
pub async fn consume(client: &mut OperatorClient, code: &str, json: bool) -> Result<()> {
    match client
        .call(&IpcRequest::ConsumeCode {
            code: code.to_string(),
        })
        .await
    {
        Ok(IpcResponse::Ok { message }) => print_message(
            message.as_deref().unwrap_or("two-factor code consumed"),
            json,
        ),
        Ok(other) => bail!("unexpected response to consume_code: {other:?}"),
        Err(e) if e.code() == Some(ErrorCode::NotFound) => Err(anyhow!(
            "code {code} is unknown, expired or already consumed"
        )),
        Err(e) => Err(e).context("failed to consume two-factor code"),
    }
}

fn render_codes(codes: &[TwoFactorCode], now: DateTime<Utc>) -> String {
    if codes.is_empty() {
        return "No pending two-factor codes\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:<10} {:<22} {:<12}", "CODE", "RECEIVED", "EXPIRES");
    let _ = writeln!(out, "{}", "-".repeat(46));
    for code in codes {
        let _ = writeln!(
            out,
            "{:<10} {:<22} {:<12}",
            code.code,
            code.issued_at.format("%Y-%m-%d %H:%M:%S"),
            format_remaining(code.expires_at, now)
        );
    }
    out
}
