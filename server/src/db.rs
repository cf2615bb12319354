use sqlx::{postgres::PgPoolOptions, PgPool};

/// Connect to Postgres using the provided DATABASE_URL and make sure the
/// tables the server reads and writes exist.
pub async fn connect(url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passages (
            id SERIAL PRIMARY KEY,
            text TEXT UNIQUE NOT NULL,
            difficulty TEXT NOT NULL DEFAULT 'medium',
            category TEXT NOT NULL DEFAULT 'common',
            source_url TEXT,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS race_results (
            race_id TEXT PRIMARY KEY,
            room_code TEXT NOT NULL,
            payload TEXT NOT NULL,
            committed_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}
