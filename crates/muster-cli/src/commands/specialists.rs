//! `muster specialists`: Show the specialist registry, optionally after
//! storing overrides from a YAML file.

use muster_core::orchestration::SpecialistKind;
use muster_core::state::AppState;
use muster_core::store::SpecialistOverride;

/// Parse a YAML list of specialist overrides.
pub fn parse_overrides(yaml: &str) -> Result<Vec<SpecialistOverride>, String> {
    let entries: Vec<SpecialistOverride> =
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse overrides YAML: {}", e))?;
    if let Some(blank) = entries.iter().position(|e| e.id.trim().is_empty()) {
        return Err(format!("override #{} has an empty id", blank + 1));
    }
    Ok(entries)
}

/// Persist overrides. They take effect the next time state is initialized.
pub async fn apply_overrides(state: &AppState, path: &str) -> Result<usize, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read overrides file '{}': {}", path, e))?;
    let entries = parse_overrides(&content)?;
    for entry in &entries {
        state
            .specialist_store
            .upsert(entry)
            .await
            .map_err(|e| e.to_string())?;
    }
    tracing::info!("[CLI] Stored {} specialist override(s) from {}", entries.len(), path);
    Ok(entries.len())
}

pub async fn list(state: &AppState, overrides: Option<&str>) -> Result<(), String> {
    if let Some(path) = overrides {
        let count = apply_overrides(state, path).await?;
        println!("Stored {} override(s); they apply from the next invocation.", count);
        println!();
    }

    let registry = &state.registry;
    println!("{:<26} {:<10} {}", "ID", "KIND", "TOOLS / CHILDREN");
    for specialist in registry.all() {
        let (kind, members) = match &specialist.kind {
            SpecialistKind::Leaf(tools) => ("leaf", tools.join(", ")),
            SpecialistKind::Composite(children) => ("composite", children.join(", ")),
        };
        let marker = if specialist.id == registry.default_id() { " (default)" } else { "" };
        println!("{:<26} {:<10} {}", format!("{}{}", specialist.id, marker), kind, members);
        println!("    {}", specialist.description);
    }
    Ok(())
}
