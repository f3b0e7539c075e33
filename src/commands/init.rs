use crate::commands::Out;
use crate::{Config, Result};
use std::path::Path;

/// Creates the ledger home directory with:
/// - an initial `config.json` naming `budget_id`,
/// - the SQLite store,
/// - an empty budget owned by `owner`.
///
/// # Errors
/// - Returns an error if any file operations fail or if `ledger_home` already holds a store.
pub async fn init(ledger_home: &Path, budget_id: &str, owner: &str) -> Result<Out<()>> {
    let config = Config::create(ledger_home, budget_id, owner).await?;
    Ok(format!(
        "Successfully created budget '{budget_id}' in {}",
        config.root().display()
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("ledger");
        let out = init(&home, "household", "u1").await.unwrap();
        assert!(out.message().contains("household"));
        let config = Config::load(&home).await.unwrap();
        assert_eq!(config.budget_id(), "household");
    }
}
