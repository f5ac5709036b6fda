//! Choosing which part of a message to render.

use {
    mimeview_common::{Message, MessagePart, MimeType},
    mimeview_config::AlternativePolicy,
};

/// Index of the part to render, or `None` when nothing is renderable.
///
/// Each alternative is tried in configured order against the parts in
/// message order; within one alternative the first matching part is taken.
/// Under [`AlternativePolicy::FirstRule`] the first alternative with a match
/// decides. Under [`AlternativePolicy::LastRule`] every alternative is scanned
/// and the last one with a match decides. With no alternative matching, the
/// first part whose type is `text` (any case) is used.
#[must_use]
pub fn select_index(
    message: &Message,
    alternatives: &[MimeType],
    policy: AlternativePolicy,
) -> Option<usize> {
    let mut matches = alternatives.iter().filter_map(|alt| {
        message
            .parts
            .iter()
            .position(|part| alt.matches(&part.type_, &part.subtype))
    });

    let chosen = match policy {
        AlternativePolicy::FirstRule => matches.next(),
        AlternativePolicy::LastRule => matches.last(),
    };

    chosen.or_else(|| {
        message
            .parts
            .iter()
            .position(|part| part.type_.eq_ignore_ascii_case("text"))
    })
}

/// The part to render, or `None` when nothing is renderable.
#[must_use]
pub fn select_part<'a>(
    message: &'a Message,
    alternatives: &[MimeType],
    policy: AlternativePolicy,
) -> Option<&'a MessagePart> {
    select_index(message, alternatives, policy).map(|i| &message.parts[i])
}
