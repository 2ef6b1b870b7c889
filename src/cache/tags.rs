//! Comma-separated tag lists, as carried by `x-cache-tags`,
//! `x-invalidate-cache-tags` and the `cache_tags` query argument.

/// Splits a tag list on commas.
///
/// Whitespace around each tag is trimmed, empty items are dropped and
/// repeated tags keep only their first position.
///
/// # Examples
///
/// ```
/// use cache_entity::cache::parse_tags;
///
/// assert_eq!(parse_tags("cache:products, cache:users,,cache:products"),
///            vec!["cache:products", "cache:users"]);
/// assert!(parse_tags(" , ").is_empty());
/// ```
pub fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tags.iter().any(|seen| seen == tag) {
            tags.push(tag.to_owned());
        }
    }
    tags
}

/// Like [`parse_tags`], but treats an absent list the same as an empty one.
pub fn parse_optional_tags(raw: Option<&str>) -> Vec<String> {
    raw.map(parse_tags).unwrap_or_default()
}
