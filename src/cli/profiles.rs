use anyhow::{Result, anyhow};

use super::ServeFlags;
use super::serve::build_controller;
use crate::core::desk::DeskApi;
use crate::core::profiles::ProfileStore;
use crate::core::terminal::{self, print_status};

pub async fn list_profiles(flags: ServeFlags) -> Result<()> {
    let config = flags.load_config().await?;
    let store = ProfileStore::load(&config.server.profiles_path).await?;

    if store.is_empty() {
        terminal::print_warn(&format!(
            "No profiles in {}",
            config.server.profiles_path.display()
        ));
        return Ok(());
    }

    terminal::print_info(&format!(
        "{} profile(s) in {}",
        store.len(),
        config.server.profiles_path.display()
    ));
    for profile in store.sanitized() {
        print_status(
            &profile.profile_name,
            &format!(
                "org {} / department {} / from {}",
                profile.org_id,
                profile.default_department_id,
                profile.from_email_address.as_deref().unwrap_or("(desk default)")
            ),
        );
    }
    Ok(())
}

/// Token refresh plus identity probe for a single profile.
pub async fn check_profile(flags: ServeFlags) -> Result<()> {
    let name = flags
        .positional
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("Usage: desk-relay check <profile>"))?;
    let config = flags.load_config().await?;
    let store = ProfileStore::load(&config.server.profiles_path).await?;
    let profile = store
        .get(&name)
        .ok_or_else(|| anyhow!("Profile '{}' not found.", name))?;

    let controller = build_controller(&config)?;
    let api = controller.api();

    api.token_info(&profile)
        .await
        .map_err(|e| anyhow!("Token refresh failed for '{}': {}", name, e.user_message()))?;
    terminal::print_success(&format!("Token refreshed for '{}'.", name));

    match api.my_info(&profile).await {
        Ok(info) => {
            let who = ["name", "firstName", "emailId"]
                .iter()
                .find_map(|k| info.get(*k).and_then(|v| v.as_str()))
                .unwrap_or("unknown agent");
            terminal::print_success(&format!("Desk API reachable as {}.", who));
        }
        Err(e) => terminal::print_warn(&format!(
            "Token is valid but the identity probe failed: {}",
            e.user_message()
        )),
    }
    Ok(())
}
