//! Container name allocation
//!
//! When a create request carries no name, the control plane picks one: the
//! base name if free on the endpoint, otherwise the base with the smallest
//! numeric suffix not already taken.

use std::collections::HashSet;

use crate::docker::{CallResult, DockerService};

/// Pure selection: base, then base-2, base-3, ...
pub fn pick_unique_name(existing: &HashSet<String>, base: &str) -> String {
    if !existing.contains(base) {
        return base.to_string();
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{}-{}", base, suffix);
        if !existing.contains(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Query the endpoint for names currently in use and allocate one.
pub async fn unique_container_name(service: &DockerService, base: &str) -> CallResult<String> {
    let containers = service.list_containers(true).await?;
    let existing: HashSet<String> = containers
        .iter()
        .flat_map(|c| c.names.iter())
        .map(|n| n.trim_start_matches('/').to_string())
        .collect();
    Ok(pick_unique_name(&existing, base))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_base_name_free() {
        assert_eq!(pick_unique_name(&names(&[]), "web"), "web");
        assert_eq!(pick_unique_name(&names(&["other"]), "web"), "web");
    }

    #[test]
    fn test_numeric_suffix() {
        assert_eq!(pick_unique_name(&names(&["web"]), "web"), "web-2");
        assert_eq!(
            pick_unique_name(&names(&["web", "web-2", "web-3"]), "web"),
            "web-4"
        );
    }

    #[test]
    fn test_gap_is_reused() {
        assert_eq!(
            pick_unique_name(&names(&["web", "web-3"]), "web"),
            "web-2"
        );
    }
}
