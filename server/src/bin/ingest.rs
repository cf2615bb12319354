use anyhow::{bail, Context};
use scraper::{Html, Selector};
use sqlx::PgPool;
use std::{env, fs, time::Duration};
use tracing::{info, warn};
use typerace_server::db;
use typerace_shared::types::{Difficulty, CATEGORIES};

const USAGE: &str = "Usage: ingest [--category <name>] [--difficulty <easy|medium|hard>] \
                     (<url> ... | --file urls.txt)";

/// Passages outside this many characters are dropped or split.
const MIN_CHARS: usize = 160;
const MAX_CHARS: usize = 480;

#[derive(Debug, PartialEq)]
struct Args {
    category: String,
    /// Forces every passage to this difficulty instead of grading it.
    difficulty: Option<Difficulty>,
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            std::process::exit(1);
        }
    };

    let database_url =
        env::var("DATABASE_URL").context("DATABASE_URL must be set for ingestion")?;
    let pool = db::connect(&database_url).await?;

    let client = reqwest::Client::builder()
        .user_agent("typerace-ingest/0.1")
        .timeout(Duration::from_secs(20))
        .build()?;

    let mut total = 0usize;
    for url in &args.urls {
        let passages = match fetch_passages(&client, url).await {
            Ok(passages) => passages,
            Err(e) => {
                warn!(url, "fetch failed: {e:#}");
                continue;
            }
        };
        info!(url, found = passages.len(), "extracted passages");
        let inserted = store(&pool, url, &args, &passages).await?;
        info!(url, inserted, "stored passages");
        total += inserted;
    }

    info!(total, category = %args.category, "ingestion finished");
    Ok(())
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args {
        category: "common".to_string(),
        difficulty: None,
        urls: Vec::new(),
    };
    let mut raw = raw.into_iter();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--category" => {
                let value = raw.next().context("--category needs a value")?;
                if value == "random" || !CATEGORIES.contains(&value.as_str()) {
                    bail!("unknown category `{value}`");
                }
                args.category = value;
            }
            "--difficulty" => {
                let value = raw.next().context("--difficulty needs a value")?;
                args.difficulty = Some(
                    Difficulty::parse(&value)
                        .with_context(|| format!("unknown difficulty `{value}`"))?,
                );
            }
            "--file" => {
                let path = raw.next().context("--file needs a path")?;
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("reading {path}"))?;
                args.urls.extend(urls_in(&content));
            }
            _ => args.urls.push(arg),
        }
    }
    if args.urls.is_empty() {
        bail!("no URLs given");
    }
    Ok(args)
}

/// One URL per line; `#` starts a comment.
fn urls_in(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}

async fn fetch_passages(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<String>> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        bail!("HTTP {}", resp.status());
    }
    let body = resp.text().await?;
    Ok(passages_from_html(&body))
}

fn passages_from_html(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Ok(paragraph) = Selector::parse("p") else {
        return Vec::new();
    };
    let sentences = doc
        .select(&paragraph)
        .map(|p| collapse_whitespace(&p.text().collect::<String>()))
        .filter(|text| text.chars().any(char::is_alphabetic))
        .flat_map(|text| sentences(&text));
    pack(sentences)
}

/// Splits on sentence-ending punctuation, keeping the punctuation.
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                out.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        out.push(format!("{rest}."));
    }
    out
}

/// Greedily packs whole sentences into passages of MIN_CHARS..=MAX_CHARS.
fn pack(sentences: impl Iterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    for sentence in sentences {
        if sentence.len() > MAX_CHARS {
            continue;
        }
        if !buf.is_empty() && buf.len() + 1 + sentence.len() > MAX_CHARS {
            if buf.len() >= MIN_CHARS {
                out.push(std::mem::take(&mut buf));
            } else {
                buf.clear();
            }
        }
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(&sentence);
    }
    if buf.len() >= MIN_CHARS {
        out.push(buf);
    }
    out
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Grades a passage by average word length and the share of characters that
/// are neither letters nor spaces.
fn classify(text: &str) -> Difficulty {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Difficulty::Easy;
    }
    let letters: usize = words
        .iter()
        .map(|w| w.chars().filter(|c| c.is_alphabetic()).count())
        .sum();
    let avg_word = letters as f64 / words.len() as f64;

    let total = text.chars().count() as f64;
    let symbols = text
        .chars()
        .filter(|c| !c.is_alphabetic() && !c.is_whitespace())
        .count() as f64;
    let symbol_density = symbols / total;

    if avg_word >= 6.0 || symbol_density >= 0.08 {
        Difficulty::Hard
    } else if avg_word >= 4.6 || symbol_density >= 0.04 {
        Difficulty::Medium
    } else {
        Difficulty::Easy
    }
}

async fn store(
    pool: &PgPool,
    source_url: &str,
    args: &Args,
    passages: &[String],
) -> anyhow::Result<usize> {
    let mut inserted = 0usize;
    for text in passages {
        let difficulty = args.difficulty.unwrap_or_else(|| classify(text));
        let res = sqlx::query(
            r#"INSERT INTO passages (text, difficulty, category, source_url)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (text) DO NOTHING"#,
        )
        .bind(text)
        .bind(difficulty.as_str())
        .bind(&args.category)
        .bind(source_url)
        .execute(pool)
        .await?;
        inserted += res.rows_affected() as usize;
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> anyhow::Result<Args> {
        parse_args(raw.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let parsed = args(&["--category", "science", "https://a.example", "https://b.example"]).unwrap();
        assert_eq!(parsed.category, "science");
        assert_eq!(parsed.difficulty, None);
        assert_eq!(parsed.urls.len(), 2);

        let forced = args(&["--difficulty", "hard", "https://a.example"]).unwrap();
        assert_eq!(forced.difficulty, Some(Difficulty::Hard));
        assert_eq!(forced.category, "common");

        assert!(args(&[]).is_err());
        assert!(args(&["--category", "random", "https://a.example"]).is_err());
        assert!(args(&["--category"]).is_err());
    }

    #[test]
    fn test_url_file_comments() {
        let urls: Vec<String> = urls_in("# list\nhttps://a.example # main\n\n  https://b.example\n").collect();
        assert_eq!(urls, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("the cat sat on the mat and ran to the big red dog"), Difficulty::Easy);
        assert_eq!(
            classify("Photosynthesis converts electromagnetic radiation into chemical potential energy."),
            Difficulty::Hard
        );
        assert_eq!(classify("fn main() { let x = vec![1, 2]; }"), Difficulty::Hard);
        assert_eq!(
            classify("Rivers carry water from the hills toward every coastal town."),
            Difficulty::Medium
        );
    }

    #[test]
    fn test_sentences_keep_punctuation() {
        assert_eq!(
            sentences("One. Two!  Three? tail"),
            vec!["One.", "Two!", "Three?", "tail."]
        );
    }

    #[test]
    fn test_extracts_bounded_passages() {
        let sentence = "This sentence is exactly long enough to be useful for packing tests here.";
        let paragraph = std::iter::repeat(sentence).take(12).collect::<Vec<_>>().join(" ");
        let html = format!("<html><body><p>{paragraph}</p><p>1234</p></body></html>");

        let passages = passages_from_html(&html);
        assert!(!passages.is_empty());
        for passage in &passages {
            assert!((MIN_CHARS..=MAX_CHARS).contains(&passage.len()), "{}", passage.len());
            assert!(passage.ends_with('.'));
        }
    }
}
