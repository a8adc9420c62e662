use std::collections::HashSet;

use ammonia::Builder;
use once_cell::sync::Lazy;

/// Feed content is untrusted HTML; this allowlist is deliberately narrow —
/// enough for article bodies to render (links, basic structure, images) with
/// no script/style/event-handler surface.
static CLEANER: Lazy<Builder<'static>> = Lazy::new(|| {
    let mut builder = Builder::default();
    builder.add_tags(["figure", "figcaption"]);
    builder
});

/// Empty tag allowlist: removes every element but keeps the text between
/// them, unlike `ammonia::clean_text` which escapes text for safe embedding
/// rather than stripping markup out of it.
static TAG_STRIPPER: Lazy<Builder<'static>> = Lazy::new(|| {
    let mut builder = Builder::default();
    builder.tags(HashSet::new());
    builder
});

/// Strips scripts, inline event handlers, and disallowed tags/attributes from
/// feed-provided HTML before it is persisted.
pub fn clean_html(input: &str) -> String {
    CLEANER.clean(input).to_string()
}

/// Strips all markup, for fields (titles, authors) that should never carry
/// HTML at all.
pub fn strip_all_html(input: &str) -> String {
    TAG_STRIPPER.clean(input).to_string()
}
