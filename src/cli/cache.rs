// src/cli/cache.rs — `cache stats` / `cache clear`

use crate::cli::CacheAction;
use crate::core::cache::{CacheStats, PromptCache};
use crate::infra::config::Config;
use crate::infra::paths;
use crate::store::{RunStore, SqliteStore};

pub async fn run_cache(action: CacheAction, config: &Config) -> anyhow::Result<()> {
    let db_path = paths::db_path();
    if !db_path.exists() {
        println!("Prompt cache is empty (database not initialized).");
        return Ok(());
    }
    let store = SqliteStore::open(&db_path)?;

    match action {
        CacheAction::Stats => {
            let cache = PromptCache::from_config(&config.cache);
            let persisted = store.load_cache_entries()?;
            let total = persisted.len();
            let live = cache.restore(persisted);
            let price = config.providers.standard.input_price_per_mtok;
            let savings = cache.estimate_savings(price);
            print!("{}", render_stats(&cache.stats(), total - live, savings));
        }
        CacheAction::Clear => {
            let removed = store.clear_cache_entries()?;
            println!("Removed {removed} cache entries.");
        }
    }
    Ok(())
}

pub fn render_stats(stats: &CacheStats, expired: usize, savings: f64) -> String {
    let mut out = String::new();
    out.push_str(&format!("  Entries:      {}", stats.entries));
    if expired > 0 {
        out.push_str(&format!(" ({expired} expired)"));
    }
    out.push('\n');
    out.push_str(&format!("  Total usage:  {}\n", stats.total_usage));
    out.push_str(&format!("  Tokens saved: {}\n", stats.tokens_saved));
    out.push_str(&format!("  Est. savings: {savings:.4} (standard tier input price)\n"));
    if let Some((ref key, count)) = stats.most_used {
        out.push_str(&format!("  Most used:    {} ({count} uses)\n", &key[..key.len().min(12)]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_stats() {
        let stats = CacheStats {
            entries: 3,
            total_usage: 7,
            tokens_saved: 1500,
            most_used: Some(("abcdef0123456789".into(), 4)),
            ..Default::default()
        };
        let text = render_stats(&stats, 1, 0.0042);
        assert!(text.contains("Entries:      3 (1 expired)"));
        assert!(text.contains("Tokens saved: 1500"));
        assert!(text.contains("0.0042"));
        assert!(text.contains("abcdef012345 (4 uses)"));
    }
}
