//! Tenant URL slugs: lowercase ASCII letters, digits and inner hyphens, 3 to 48 characters.

pub const MIN_LEN: usize = 3;
pub const MAX_LEN: usize = 48;

/// Derive a slug from free text, e.g. a company name.
///
/// The result may still be too short to be valid; run it through [`validate`].
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.truncate(MAX_LEN);
    slug.trim_end_matches('-').to_string()
}

/// Lowercase and trim a user-supplied slug without otherwise rewriting it.
pub fn normalize(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}

pub fn validate(slug: &str) -> Result<(), &'static str> {
    if slug.len() < MIN_LEN {
        return Err("must be at least 3 characters");
    }
    if slug.len() > MAX_LEN {
        return Err("must be at most 48 characters");
    }
    if !slug.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
        return Err("may only contain lowercase letters, digits and hyphens");
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err("cannot start or end with a hyphen");
    }
    Ok(())
}
