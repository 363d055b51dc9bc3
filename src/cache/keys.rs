//! Cache key construction.
//!
//! Keys are `prefix:subject[:suffix...]`. Construction is a pure function of
//! its inputs, so the same logical entry always lands on the same string.
//! Tag sets live beside the data under `tag:<name>`.

/// Separator between key segments.
pub const DELIMITER: &str = ":";

/// Prefix of every tag-set key.
pub const TAG_PREFIX: &str = "tag";

/// Domain areas used as the first key segment.
pub mod prefix {
    pub const USER: &str = "user";
    pub const ROADMAP: &str = "roadmap";
    pub const TEMPLATE: &str = "template";
    pub const ANALYTICS: &str = "analytics";
    pub const RESOURCE: &str = "resource";
    pub const ACHIEVEMENT: &str = "achievement";
    pub const PLATFORM: &str = "platform";
    /// Default namespace of the request-cache middleware.
    pub const HTTP: &str = "http";
}

/// Joins a prefix, a subject and optional suffixes into a key.
///
/// # Examples
///
/// ```
/// use rcache::cache::keys;
///
/// assert_eq!(keys::build("user", "42", &["profile"]), "user:42:profile");
/// assert_eq!(keys::build("template", "featured", &[]), "template:featured");
/// ```
pub fn build(prefix: &str, subject: &str, suffixes: &[&str]) -> String {
    let len = prefix.len()
        + subject.len()
        + suffixes.iter().map(|s| s.len() + 1).sum::<usize>()
        + 1;
    let mut key = String::with_capacity(len);
    key.push_str(prefix);
    key.push_str(DELIMITER);
    key.push_str(subject);
    for suffix in suffixes {
        key.push_str(DELIMITER);
        key.push_str(suffix);
    }
    key
}

/// Characters with a meaning in store glob patterns.
pub const GLOB_META: &[char] = &['*', '?', '[', ']', '\\'];

/// Whether `segment` can be spliced into a glob and match only itself.
pub fn is_glob_safe(segment: &str) -> bool {
    !segment.contains(GLOB_META)
}

/// Glob matching every key under `prefix:subject:`.
///
/// Returns `None` when either segment holds a glob metacharacter, since the
/// pattern would then reach keys outside the subtree.
///
/// # Examples
///
/// ```
/// use rcache::cache::keys;
///
/// assert_eq!(keys::subtree("user", "42").as_deref(), Some("user:42:*"));
/// assert_eq!(keys::subtree("user", "*"), None);
/// ```
pub fn subtree(prefix: &str, subject: &str) -> Option<String> {
    (is_glob_safe(prefix) && is_glob_safe(subject))
        .then(|| format!("{prefix}{DELIMITER}{subject}{DELIMITER}*"))
}

/// Suffixes written under each prefix by the application's read paths.
pub fn known_suffixes(prefix: &str) -> &'static [&'static str] {
    match prefix {
        prefix::USER => &["profile", "settings", "roadmaps", "dashboard"],
        prefix::ROADMAP => &["detail", "steps", "progress"],
        prefix::ANALYTICS => &["7d", "30d", "90d", "overview"],
        prefix::ACHIEVEMENT => &["all", "progress"],
        prefix::RESOURCE => &["list"],
        prefix::PLATFORM => &["trends"],
        prefix::TEMPLATE => &["detail"],
        _ => &[],
    }
}

/// The bare `prefix:subject` key followed by every known key under it.
///
/// Exact keys reach a store that cannot enumerate, where [`subtree`] globs
/// do nothing.
pub fn known_keys(prefix: &str, subject: &str) -> Vec<String> {
    let suffixes = known_suffixes(prefix);
    let mut keys = Vec::with_capacity(suffixes.len() + 1);
    keys.push(build(prefix, subject, &[]));
    keys.extend(suffixes.iter().map(|suffix| build(prefix, subject, &[suffix])));
    keys
}

/// Store key of the set that tracks members of `tag`.
pub fn tag_key(tag: &str) -> String {
    format!("{TAG_PREFIX}{DELIMITER}{tag}")
}

/// Recovers the tag name from a tag-set key.
pub fn tag_name(tag_key: &str) -> Option<&str> {
    tag_key
        .strip_prefix(TAG_PREFIX)
        .and_then(|rest| rest.strip_prefix(DELIMITER))
}

/// Glob matching every tag-set key.
pub fn all_tags() -> String {
    format!("{TAG_PREFIX}{DELIMITER}*")
}

/// Well-known tag names, shared by writers and the invalidator.
pub mod tags {
    use super::{DELIMITER, prefix};

    pub fn user(user_id: &str) -> String {
        format!("{}{DELIMITER}{user_id}", prefix::USER)
    }

    pub fn roadmap(roadmap_id: &str) -> String {
        format!("{}{DELIMITER}{roadmap_id}", prefix::ROADMAP)
    }

    pub fn template(template_id: &str) -> String {
        format!("{}{DELIMITER}{template_id}", prefix::TEMPLATE)
    }

    /// Every template list (featured, by category, search pages).
    pub const TEMPLATE_LISTS: &str = "templates";

    pub fn analytics(user_id: &str) -> String {
        format!("{}{DELIMITER}{user_id}", prefix::ANALYTICS)
    }

    pub fn resource_category(category: &str) -> String {
        format!("{}{DELIMITER}{category}", prefix::RESOURCE)
    }

    pub fn achievements(user_id: &str) -> String {
        format!("{}{DELIMITER}{user_id}", prefix::ACHIEVEMENT)
    }

    pub fn platform(platform: &str) -> String {
        format!("{}{DELIMITER}{platform}", prefix::PLATFORM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_is_deterministic() {
        let a = build(prefix::ANALYTICS, "u1", &["30d"]);
        let b = build(prefix::ANALYTICS, "u1", &["30d"]);
        assert_eq!(a, b);
        assert_eq!(a, "analytics:u1:30d");
    }

    #[test]
    fn tag_key_round_trip() {
        let key = tag_key("user:42");
        assert_eq!(key, "tag:user:42");
        assert_eq!(tag_name(&key), Some("user:42"));
        assert_eq!(tag_name("user:42"), None);
        assert_eq!(tag_name("tagged:x"), None);
    }

    #[test]
    fn subtree_glob() {
        assert_eq!(subtree(prefix::USER, "42").as_deref(), Some("user:42:*"));
        assert_eq!(all_tags(), "tag:*");
    }

    #[test]
    fn subtree_refuses_glob_subjects() {
        for subject in ["*", "4?", "[0-9]", "a\\*", "42*"] {
            assert_eq!(subtree(prefix::USER, subject), None, "{subject}");
        }
        assert!(is_glob_safe("user-42.v2"));
    }

    #[test]
    fn known_keys_start_with_the_bare_key() {
        assert_eq!(
            known_keys(prefix::ACHIEVEMENT, "42"),
            vec!["achievement:42", "achievement:42:all", "achievement:42:progress"]
        );
        assert_eq!(known_keys("session", "abc"), vec!["session:abc"]);
    }

    #[test]
    fn tag_helpers_share_the_key_grammar() {
        assert_eq!(tags::user("42"), "user:42");
        assert_eq!(tags::resource_category("video"), "resource:video");
    }
}
