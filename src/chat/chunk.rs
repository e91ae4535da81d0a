/// Discord's per-message character limit.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Pack lines into messages of at most `max_chars` characters, breaking only
/// between lines. Every line keeps its trailing `\n`, so concatenating the
/// chunks gives back the input, except for blank lines that would make up a
/// message on their own. A single line longer than `max_chars` is
/// hard-split as a last resort.
pub fn chunk_lines<I, S>(lines: I, max_chars: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    assert!(max_chars > 1, "chunk size must leave room for a newline");

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for line in lines {
        let line = line.as_ref();
        let needed = line.chars().count() + 1;

        if current_chars + needed > max_chars && !current.is_empty() {
            push_visible(&mut chunks, std::mem::take(&mut current));
            current_chars = 0;
        }

        if needed > max_chars {
            let chars: Vec<char> = line.chars().collect();
            let mut pieces: Vec<String> = chars
                .chunks(max_chars)
                .map(|piece| piece.iter().collect())
                .collect();
            let mut last = pieces.pop().unwrap_or_default();
            if last.chars().count() == max_chars {
                // a newline alone would be a blank message
                let moved = last.pop().map(String::from).unwrap_or_default();
                pieces.push(last);
                last = moved;
            }
            last.push('\n');
            chunks.extend(pieces);
            current_chars = last.chars().count();
            current = last;
            continue;
        }

        current.push_str(line);
        current.push('\n');
        current_chars += needed;
    }

    push_visible(&mut chunks, current);
    chunks
}

/// Chat services reject blank messages.
fn push_visible(chunks: &mut Vec<String>, chunk: String) {
    if !chunk.trim().is_empty() {
        chunks.push(chunk);
    }
}

/// Chunk free text (e.g. a problem body) along its own line breaks.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    chunk_lines(text.lines(), max_chars)
}
