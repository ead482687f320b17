//! Session titles
//!
//! New sessions get a random three-part name. Duplicates reuse the base title
//! with the next free numeric suffix.

use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "ancient", "azure", "brave", "bright", "calm", "crimson", "dusty", "emerald", "gentle",
    "golden", "hidden", "hollow", "lucky", "misty", "quiet", "rapid", "silent", "silver",
    "steady", "swift", "velvet", "wild",
];

const NOUNS: &[&str] = &[
    "comet", "delta", "echo", "falcon", "flux", "glyph", "harbor", "lantern", "meadow", "nova",
    "orbit", "pixel", "prism", "quartz", "raven", "river", "signal", "spark", "tide", "vortex",
];

/// Random `adjective-adjective-noun` title
pub fn generate_title() -> String {
    let mut rng = rand::thread_rng();
    let first = ADJECTIVES.choose(&mut rng).unwrap_or(&"quiet");
    let second = ADJECTIVES.choose(&mut rng).unwrap_or(&"swift");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"river");
    format!("{first}-{second}-{noun}")
}

/// Split `"base 3"` into `("base", Some(3))`. Titles without a numeric
/// suffix are returned whole.
pub fn split_suffix(title: &str) -> (&str, Option<u32>) {
    match title.rsplit_once(' ') {
        Some((base, suffix))
            if !base.is_empty()
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            match suffix.parse() {
                Ok(n) => (base, Some(n)),
                Err(_) => (title, None),
            }
        }
        _ => (title, None),
    }
}

/// Title for a copy of `title`, given the titles the owner already has
pub fn next_duplicate_title<'a>(title: &str, existing: impl IntoIterator<Item = &'a str>) -> String {
    let (base, _) = split_suffix(title);
    let max = existing
        .into_iter()
        .filter_map(|other| match split_suffix(other) {
            (other_base, Some(n)) if other_base == base => Some(n),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    format!("{base} {}", max.saturating_add(1))
}
