use tracing::debug;

use crate::events::Event;

/// Fold every run of consecutive `token` events into one.
///
/// Non-token events keep their order and position relative to the text
/// around them. A `token` event without string data counts as empty text,
/// and a run that adds up to no text at all is dropped.
/// Compacting an already compacted sequence returns it unchanged.
pub fn compact(events: &[Event]) -> Vec<Event> {
    let mut out = Vec::with_capacity(events.len());
    let mut run = String::new();

    for event in events {
        if event.is_token() {
            run.push_str(event.token_text().unwrap_or_default());
            continue;
        }
        if !run.is_empty() {
            out.push(Event::Token(std::mem::take(&mut run)));
        }
        out.push(event.clone());
    }
    if !run.is_empty() {
        out.push(Event::Token(run));
    }

    debug!(before = events.len(), after = out.len(), "compacted events");
    out
}
