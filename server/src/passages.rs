use async_trait::async_trait;
use rand::Rng;
use sqlx::PgPool;
use tracing::{info, warn};
use typerace_shared::{
    passages::{candidates, Passage},
    types::Difficulty,
};

/// Source of race texts. Implementations never fail: when their backing store
/// has nothing suitable they fall back to the built-in catalog.
#[async_trait]
pub trait PassageProvider: Send + Sync {
    async fn passage(&self, difficulty: Difficulty, category: Option<&str>) -> Passage;
}

/// Random pick from the built-in catalog.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticPassages;

#[async_trait]
impl PassageProvider for StaticPassages {
    async fn passage(&self, difficulty: Difficulty, category: Option<&str>) -> Passage {
        pick_static(difficulty, category)
    }
}

fn pick_static(difficulty: Difficulty, category: Option<&str>) -> Passage {
    // The catalog is never empty, so neither is the candidate list.
    let mut pool = candidates(difficulty, category);
    let index = rand::thread_rng().gen_range(0..pool.len());
    pool.swap_remove(index)
}

/// Always serves the same passage. Useful for drills and deterministic races.
#[derive(Clone, Debug)]
pub struct FixedPassage(pub Passage);

#[async_trait]
impl PassageProvider for FixedPassage {
    async fn passage(&self, _difficulty: Difficulty, _category: Option<&str>) -> Passage {
        self.0.clone()
    }
}

/// Passages ingested into Postgres, with the static catalog as fallback.
pub struct PgPassages {
    pool: PgPool,
}

impl PgPassages {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PassageProvider for PgPassages {
    async fn passage(&self, difficulty: Difficulty, category: Option<&str>) -> Passage {
        let row = sqlx::query_as::<_, (i32, String, String, String)>(
            r#"
            SELECT id, text, difficulty, category FROM passages
            WHERE difficulty = $1 AND ($2::TEXT IS NULL OR category = $2)
            ORDER BY random() LIMIT 1
            "#,
        )
        .bind(difficulty.as_str())
        .bind(category)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some((id, text, stored_difficulty, category))) => {
                info!(passage_id = id, "passage_source = db");
                return Passage::new(
                    format!("db-{id}"),
                    text,
                    Difficulty::parse(&stored_difficulty).unwrap_or(difficulty),
                    category,
                );
            }
            Ok(None) => {
                info!(difficulty = difficulty.as_str(), ?category, "no db passage matches");
            }
            Err(e) => {
                warn!("db_passage_fetch_failed = {:?}", e);
            }
        }
        // Fallback to static
        pick_static(difficulty, category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_respects_filters() {
        for _ in 0..20 {
            let passage = StaticPassages.passage(Difficulty::Medium, Some("science")).await;
            assert_eq!(passage.id, "7");
        }
        let passage = StaticPassages.passage(Difficulty::Hard, None).await;
        assert_eq!(passage.difficulty, Difficulty::Hard);
    }

    #[tokio::test]
    async fn test_fixed_passage() {
        let fixed = FixedPassage(Passage::new("drill", "asdf jkl;", Difficulty::Easy, "common"));
        let passage = fixed.passage(Difficulty::Hard, Some("science")).await;
        assert_eq!(passage.id, "drill");
    }
}
