use serde::{Deserialize, Serialize};

use crate::types::Difficulty;

/// Immutable race text. Every member of a room races the same instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    pub difficulty: Difficulty,
    pub category: String,
    pub word_count: usize,
    pub char_count: usize,
}

impl Passage {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        difficulty: Difficulty,
        category: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            word_count: text.split_whitespace().count(),
            char_count: text.chars().count(),
            text,
            difficulty,
            category: category.into(),
        }
    }
}

struct CatalogEntry {
    id: &'static str,
    difficulty: Difficulty,
    category: &'static str,
    text: &'static str,
}

/// Static passages for typing races
const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: "1",
        difficulty: Difficulty::Easy,
        category: "common",
        text: "The quick brown fox jumps over the lazy dog. This pangram contains every letter of the alphabet at least once.",
    },
    CatalogEntry {
        id: "2",
        difficulty: Difficulty::Medium,
        category: "common",
        text: "The only way to do great work is to love what you do. If you haven't found it yet, keep looking, and don't settle.",
    },
    CatalogEntry {
        id: "3",
        difficulty: Difficulty::Easy,
        category: "literature",
        text: "All happy families are alike; each unhappy family is unhappy in its own way.",
    },
    CatalogEntry {
        id: "4",
        difficulty: Difficulty::Medium,
        category: "literature",
        text: "It was the best of times, it was the worst of times, it was the age of wisdom, it was the age of foolishness.",
    },
    CatalogEntry {
        id: "5",
        difficulty: Difficulty::Medium,
        category: "programming",
        text: "Programming is not about typing, it's about thinking. The keyboard is just the interface between your thoughts and the computer.",
    },
    CatalogEntry {
        id: "6",
        difficulty: Difficulty::Hard,
        category: "programming",
        text: "fn main() { let v: Vec<u32> = (1..=10).filter(|n| n % 2 == 0).collect(); } WebAssembly is a binary instruction format for a stack-based virtual machine.",
    },
    CatalogEntry {
        id: "7",
        difficulty: Difficulty::Medium,
        category: "science",
        text: "Light from the Sun takes a little over eight minutes to reach Earth, crossing roughly 150 million kilometres of empty space.",
    },
    CatalogEntry {
        id: "8",
        difficulty: Difficulty::Hard,
        category: "science",
        text: "Photosynthesis converts carbon dioxide and water into glucose and oxygen (6CO2 + 6H2O -> C6H12O6 + 6O2), storing solar energy in chemical bonds.",
    },
];

impl CatalogEntry {
    fn to_passage(&self) -> Passage {
        Passage::new(self.id, self.text, self.difficulty, self.category)
    }
}

/// Built-in passages matching the filters. When nothing matches, the category
/// filter is dropped first, then the difficulty filter.
pub fn candidates(difficulty: Difficulty, category: Option<&str>) -> Vec<Passage> {
    let matching = |entry: &&CatalogEntry, by_category: bool| {
        entry.difficulty == difficulty
            && (!by_category || category.map_or(true, |c| entry.category == c))
    };

    let mut found: Vec<Passage> = CATALOG
        .iter()
        .filter(|e| matching(e, true))
        .map(CatalogEntry::to_passage)
        .collect();
    if found.is_empty() {
        found = CATALOG
            .iter()
            .filter(|e| matching(e, false))
            .map(CatalogEntry::to_passage)
            .collect();
    }
    if found.is_empty() {
        found = CATALOG.iter().map(CatalogEntry::to_passage).collect();
    }
    found
}
