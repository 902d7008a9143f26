//! `adnode campaigns ...`

use std::fmt::Write as _;

use adnode_core::ipc::{IpcRequest, IpcResponse};
use adnode_core::link::CampaignLink;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use super::{format_remaining, print_json};
use crate::client::OperatorClient;

/// Lists the active campaign links.
pub async fn list(client: &mut OperatorClient, json: bool) -> Result<()> {
    let response = client
        .call(&IpcRequest::ListLinks)
        .await
        .context("failed to list campaign links")?;
    let IpcResponse::LinkList { links } = response else {
        bail!("unexpected response to list_links: {response:?}");
    };

    if json {
        return print_json(&links);
    }
    print!("{}", render_links(&links, Utc::now()));
    Ok(())
}

/// Forces a fresh link for one campaign.
pub async fn refresh(client: &mut OperatorClient, campaign_id: &str, json: bool) -> Result<()> {
    let response = client
        .call(&IpcRequest::RefreshLink {
            campaign_id: campaign_id.to_string(),
        })
        .await
        .with_context(|| format!("failed to refresh link for campaign '{campaign_id}'"))?;
    let IpcResponse::Link { link } = response else {
        bail!("unexpected response to refresh_link: {response:?}");
    };

    if json {
        return print_json(&link);
    }
    println!("Campaign {}: new token {}", link.campaign_id, link.link_token);
    Ok(())
}

fn render_links(links: &[CampaignLink], now: DateTime<Utc>) -> String {
    if links.is_empty() {
        return "No active campaign links\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:<34} {:<8} {:<12}",
        "CAMPAIGN", "TOKEN", "STATUS", "EXPIRES"
    );
    let _ = writeln!(out, "{}", "-".repeat(80));
    for link in links {
        let expires = link
            .expires_at
            .map_or_else(|| "never".to_string(), |at| format_remaining(at, now));
        let _ = writeln!(
            out,
            "{:<24} {:<34} {:<8} {:<12}",
            link.campaign_id,
            link.link_token,
            link.status.as_str(),
            expires
        );
    }
    out
}
