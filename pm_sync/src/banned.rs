//! ABOUTME: Removal of banned packages from a freshly synced repo version
//! ABOUTME: Enumerates content by name and strips matches via repo modify

use pm_core::Result;
use pm_pulp::{wait_for_task, PollSettings, PulpClient, RepoKind};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Remove content units whose package name matches the banned regex.
///
/// Runs after a sync completes against the repository version the sync
/// produced. Returns the number of units removed; zero means the version was
/// already clean and no mutation was issued.
pub async fn purge_banned_packages(
    client: &PulpClient,
    repo_href: &str,
    kind: RepoKind,
    version_href: &str,
    banned: &Regex,
    poll: &PollSettings,
    cancel: &CancellationToken,
) -> Result<u64> {
    let units = client.list_content(kind, version_href).await?;

    let matching: Vec<String> = units
        .iter()
        .filter(|unit| unit.unit_name().is_some_and(|name| banned.is_match(name)))
        .map(|unit| unit.pulp_href.clone())
        .collect();

    if matching.is_empty() {
        debug!(repo = %repo_href, "No banned packages in synced version");
        return Ok(0);
    }

    info!(
        repo = %repo_href,
        count = matching.len(),
        "Removing banned packages"
    );

    let task_href = client.modify_repository(repo_href, &matching).await?;
    wait_for_task(client, &task_href, poll, None, cancel).await?;

    Ok(matching.len() as u64)
}
